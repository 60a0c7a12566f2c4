//! Property tests for content addressing and card merge order

use outline_core::hlc::ManualClock;
use outline_core::{commit_tree, write_tree, Card, CardStore, Hlc, ObjectId, Timestamp, WorkingTree};
use proptest::prelude::*;
use std::sync::Arc;

fn arb_tree() -> impl Strategy<Value = WorkingTree> {
    let leaf = "[a-z ]{0,8}".prop_map(|content| WorkingTree::leaf("n", content));
    leaf.prop_recursive(3, 24, 4, |inner| {
        ("[a-z ]{0,8}", prop::collection::vec(inner, 0..4)).prop_map(|(content, children)| {
            let children = children
                .into_iter()
                .enumerate()
                .map(|(i, mut c)| {
                    c.id = format!("{}", i + 1);
                    c
                })
                .collect();
            WorkingTree::node("0", content, children)
        })
    })
}

fn fresh_store() -> CardStore {
    CardStore::new(Hlc::with_source("r", Arc::new(ManualClock::new(0))))
}

proptest! {
    #[test]
    fn prop_write_tree_is_deterministic(tree in arb_tree()) {
        let mut first = tree.clone();
        let mut second = tree;
        let a = write_tree(&mut first);
        let b = write_tree(&mut second);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(first.object_id, second.object_id);
        // Children precede parents; the root comes last
        prop_assert_eq!(a.last().map(|o| o.id), first.object_id);
    }

    #[test]
    fn prop_commit_id_is_deterministic(tree in arb_tree(), ts in 0i64..1_000_000, author in "[a-z]{1,6}") {
        let parent = ObjectId::from_data(b"parent");
        let one = commit_tree(&author, vec![parent], &mut tree.clone(), ts, None);
        let two = commit_tree(&author, vec![parent], &mut tree.clone(), ts, None);
        prop_assert_eq!(one.commit_id(), two.commit_id());
        let other = commit_tree(&author, vec![parent], &mut tree.clone(), ts + 1, None);
        prop_assert_ne!(one.commit_id(), other.commit_id());
    }

    #[test]
    fn prop_card_merge_is_order_independent(
        versions in prop::collection::vec((0usize..3, 0i64..50, "[ab]", "[a-z]{0,4}", any::<bool>()), 1..30),
        seed in any::<u64>(),
    ) {
        // Counter = index keeps every timestamp unique
        let cards: Vec<Card> = versions
            .into_iter()
            .enumerate()
            .map(|(i, (id, millis, node, content, deleted))| {
                let mut card = Card::new(format!("c{}", id), "t", None, content, 0.0);
                card.updated_at = Timestamp::new(millis, i as u32, node);
                card.deleted = deleted;
                card
            })
            .collect();

        let mut shuffled = cards.clone();
        let mut state = seed;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let mut forward = fresh_store();
        forward.merge_remote(cards.clone());
        let mut reordered = fresh_store();
        for card in shuffled {
            reordered.merge_remote(vec![card]);
        }
        prop_assert_eq!(forward.cards("t"), reordered.cards("t"));

        // Replaying everything changes nothing
        let before = forward.cards("t");
        let report = forward.merge_remote(cards);
        prop_assert!(report.changed.is_empty());
        prop_assert_eq!(forward.cards("t"), before);
    }
}
