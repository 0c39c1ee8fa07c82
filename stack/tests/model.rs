//! Checks single-threaded stack behavior against a `Vec` model.
use hyphae_stack::{AtomicStack, Linked, Links};
use proptest::prelude::*;

#[derive(Debug)]
struct Node {
    links: Links,
    id: usize,
}

impl Linked for Node {
    fn links(&self) -> &Links {
        &self.links
    }
}

#[derive(Debug, Clone)]
enum Op {
    Push(usize),
    Pop,
}

const NODES: usize = 16;

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![(0..NODES).prop_map(Op::Push), Just(Op::Pop)],
        0..128,
    )
}

proptest! {
    #[test]
    fn behaves_like_a_vec(ops in ops()) {
        let nodes = (0..NODES)
            .map(|id| Node { links: Links::new(), id })
            .collect::<Vec<_>>();
        let stack = AtomicStack::new(&nodes[..]);
        let mut model = Vec::new();

        for op in ops {
            match op {
                // pushing a linked node is fatal; the model skips those.
                Op::Push(id) if nodes[id].links.is_linked() => {
                    prop_assert!(model.contains(&id));
                }
                Op::Push(id) => {
                    stack.push(&nodes[id]);
                    model.push(id);
                }
                Op::Pop => {
                    prop_assert_eq!(stack.pop().map(|node| node.id), model.pop());
                }
            }
            prop_assert_eq!(stack.is_empty(), model.is_empty());
        }

        let rest = stack.drain().map(|node| node.id).collect::<Vec<_>>();
        model.reverse();
        prop_assert_eq!(rest, model);
    }
}

#[test]
fn owned_storage() {
    let stack = AtomicStack::new(
        (0..4)
            .map(|id| Node {
                links: Links::new(),
                id,
            })
            .collect::<Vec<_>>(),
    );
    stack.push_index(3);
    let top = stack.pop().expect("stack has one node");
    assert_eq!(top.id, 3);
    assert_eq!(stack.index_of(top), 3);
    assert!(!top.links.is_linked());
}
