use chrono::Duration;
use ladder_core::drag;
use ladder_core::model::Forest;
use ladder_core::history::HistoryStack;
use ladder_core::tree;
use proptest::prelude::*;

use generators::*;

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(256))]

    #[test]
    fn remove_then_insert_restores_tree(forest in arb_nonempty_forest(), pick in any::<prop::sample::Index>()) {
        let all = ids(&forest);
        let id = &all[pick.index(all.len())];
        let location = tree::locate(&forest, id).unwrap();

        let (without, removed) = tree::remove(&forest, id, None);
        let removed = removed.unwrap();
        prop_assert!(tree::find(&without, id).is_none());
        prop_assert_eq!(tree::count(&without) + 1 + removed.descendant_count(), tree::count(&forest));

        let restored = tree::insert(&without, removed, location.parent_id.as_deref(), location.index, None).unwrap();
        prop_assert_eq!(restored, forest);
    }

    #[test]
    fn reorder_is_dense_and_stable(forest in arb_forest(), salt in 0usize..13) {
        let scrambled = scramble_orders(&forest, salt);
        let fixed = tree::reorder(&scrambled);
        prop_assert_eq!(ids(&fixed), ids(&forest));
        prop_assert!(tree::check_shape(&fixed).is_empty());
        for (index, task) in fixed.iter().enumerate() {
            prop_assert_eq!(task.order, index);
        }
    }

    #[test]
    fn toggle_cascades_uniformly(forest in arb_nonempty_forest(), pick in any::<prop::sample::Index>(), minutes in 1i64..10_000) {
        let all = ids(&forest);
        let id = &all[pick.index(all.len())];
        let before = tree::find(&forest, id).unwrap().completed;
        let at = base_time() + Duration::minutes(minutes);

        let toggled = tree::toggle_completion(&forest, id, at).unwrap();
        let node = tree::find(&toggled, id).unwrap();
        let single: Forest = std::iter::once(node.clone()).collect();
        let subtree = tree::flatten(&single);
        prop_assert_eq!(subtree.len(), node.descendant_count() + 1);
        for task in subtree {
            prop_assert_eq!(task.completed, !before);
            prop_assert_eq!(task.updated_at, Some(at));
        }
    }

    #[test]
    fn drop_legality_follows_levels(forest in arb_nonempty_forest(), a in any::<prop::sample::Index>(), b in any::<prop::sample::Index>()) {
        let all = ids(&forest);
        let source = &all[a.index(all.len())];
        let target = &all[b.index(all.len())];
        let dragged = tree::find(&forest, source).unwrap().level;
        let over = tree::find(&forest, target).unwrap().level;

        let expected = !tree::is_descendant(&forest, source, target)
            && (dragged == over || tree::level_below(over) == Some(dragged));
        prop_assert_eq!(drag::can_drop(&forest, source, target), expected);

        let result = drag::resolve_drop(&forest, source, target, base_time());
        prop_assert_eq!(result.is_ok(), expected);
        if let Ok(moved) = result {
            prop_assert!(tree::check_shape(&moved).is_empty());
            prop_assert_eq!(tree::count(&moved), tree::count(&forest));
            let parent = tree::find_parent(&moved, source).map(|p| p.id.clone());
            if dragged == over {
                let target_parent = tree::find_parent(&moved, target).map(|p| p.id.clone());
                prop_assert_eq!(parent, target_parent);
            } else {
                prop_assert_eq!(parent.as_deref(), Some(target.as_str()));
            }
        } else {
            prop_assert!(!drag::can_drop(&forest, source, target));
        }
    }

    #[test]
    fn history_never_exceeds_capacity(pushes in 0usize..60) {
        let mut history = HistoryStack::default();
        let snapshots: Vec<_> = (0..=pushes)
            .map(|n| build(&vec![(false, Vec::new()); n]))
            .collect();
        for pair in snapshots.windows(2) {
            history.record_if_changed(&pair[0], &pair[1]);
        }
        prop_assert_eq!(history.undo_len(), pushes.min(20));
        if pushes > 20 {
            prop_assert_eq!(history.undo_entries().next(), Some(&snapshots[pushes - 20]));
        }
    }

    #[test]
    fn undo_redo_round_trip(forest in arb_nonempty_forest(), pick in any::<prop::sample::Index>()) {
        let all = ids(&forest);
        let id = &all[pick.index(all.len())];
        let next = tree::toggle_completion(&forest, id, base_time() + Duration::hours(1)).unwrap();

        let mut history = HistoryStack::default();
        prop_assert!(history.record_if_changed(&forest, &next));
        let undone = history.undo(&next).unwrap();
        prop_assert_eq!(&undone, &forest);
        let redone = history.redo(&undone).unwrap();
        prop_assert_eq!(redone, next);
        prop_assert!(!history.can_redo());
    }
}
