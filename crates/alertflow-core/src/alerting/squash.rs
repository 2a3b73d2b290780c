//! Collapse duplicate alerts into delivery groups

use std::collections::HashMap;

use crate::models::{AlertItem, SquashGroup, SquashKey};

/// Group queued alerts by `(target, alert_type)`.
///
/// A single-item queue is returned as-is under [`SquashKey::Single`]. For
/// larger queues the first item seen per key is the representative and
/// `count` tallies the duplicates. Payloads are never modified here.
pub fn squash(items: &[AlertItem]) -> HashMap<SquashKey, SquashGroup> {
    let mut squashed = HashMap::new();

    match items {
        [] => {}
        [only] => {
            squashed.insert(
                SquashKey::Single,
                SquashGroup {
                    item: only.clone(),
                    count: 1,
                },
            );
        }
        _ => {
            for item in items {
                let key = SquashKey::Group {
                    target: item.target.clone(),
                    alert_type: item.alert_type,
                };

                squashed
                    .entry(key)
                    .and_modify(|group: &mut SquashGroup| group.count += 1)
                    .or_insert_with(|| SquashGroup {
                        item: item.clone(),
                        count: 1,
                    });
            }
        }
    }

    squashed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertPayload, AlertType};
    use pretty_assertions::assert_eq;

    fn item(target: &str, alert_type: AlertType, text: &str) -> AlertItem {
        AlertItem::new(
            target,
            alert_type,
            AlertPayload::Text {
                content: text.to_string(),
            },
        )
    }

    #[test]
    fn test_empty_queue() {
        assert!(squash(&[]).is_empty());
    }

    #[test]
    fn test_single_item_kept_verbatim() {
        let only = item("https://e1", AlertType::BudgetAlerts, "one");
        let squashed = squash(std::slice::from_ref(&only));

        assert_eq!(squashed.len(), 1);
        let group = &squashed[&SquashKey::Single];
        assert_eq!(group.count, 1);
        assert_eq!(group.item, only);
    }

    #[test]
    fn test_duplicates_collapse_first_wins() {
        let items = vec![
            item("https://e1", AlertType::BudgetAlerts, "first"),
            item("https://e1", AlertType::BudgetAlerts, "second"),
            item("https://e1", AlertType::BudgetAlerts, "third"),
        ];

        let squashed = squash(&items);
        assert_eq!(squashed.len(), 1);

        let group = squashed.values().next().unwrap();
        assert_eq!(group.count, 3);
        assert_eq!(group.item, items[0]);
    }

    #[test]
    fn test_groups_by_target_and_type_only() {
        let items = vec![
            item("https://e1", AlertType::BudgetAlerts, "a"),
            item("https://e2", AlertType::BudgetAlerts, "b"),
            item("https://e1", AlertType::LlmTooSlow, "c"),
            item("https://e1", AlertType::BudgetAlerts, "d"),
        ];

        let squashed = squash(&items);
        assert_eq!(squashed.len(), 3);

        let e1_budget = &squashed[&SquashKey::Group {
            target: "https://e1".to_string(),
            alert_type: AlertType::BudgetAlerts,
        }];
        assert_eq!(e1_budget.count, 2);
    }

    #[test]
    fn test_counts_sum_to_input_length() {
        let targets = ["https://e1", "https://e2", "https://e3"];
        let types = [AlertType::BudgetAlerts, AlertType::LlmTooSlow];

        for len in 0..12 {
            let items: Vec<AlertItem> = (0..len)
                .map(|i| item(targets[i % 3], types[i % 2], "x"))
                .collect();
            let total: usize = squash(&items).values().map(|g| g.count).sum();
            assert_eq!(total, len);
        }
    }

    #[test]
    fn test_squash_does_not_decorate() {
        let items = vec![
            item("https://e1", AlertType::BudgetAlerts, "same"),
            item("https://e1", AlertType::BudgetAlerts, "same"),
        ];

        let group = squash(&items).into_values().next().unwrap();
        assert_eq!(
            group.item.payload,
            AlertPayload::Text {
                content: "same".to_string()
            }
        );
    }
}
