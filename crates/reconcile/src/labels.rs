//! Node label reconciliation: single labels and whole label folders.

use metrics::counter;
use serde_json::{json, Map, Value as Json};
use tracing::info;

use kubestate_core::{LabelMap, StateResult};

use crate::Engine;

fn label_change(node: &str, key: &str, old: &LabelMap, new: &LabelMap) -> Map<String, Json> {
    let mut changes = Map::new();
    changes.insert(format!("{}.{}", node, key), json!({ "old": old, "new": new }));
    changes
}

impl<'a> Engine<'a> {
    /// Ensures `key=value` is set on the node's labels.
    pub async fn label_present(
        &self,
        node: &str,
        key: &str,
        value: &str,
        test: bool,
    ) -> StateResult {
        counter!("state_apply_attempts", 1u64);
        let labels = match self.accessor.node_labels(node).await {
            Ok(l) => l,
            Err(e) => return StateResult::failed(key, e.to_string()),
        };

        match labels.get(key).map(String::as_str) {
            None => {
                if test {
                    return StateResult::simulated(key, "The label is going to be set");
                }
                if let Err(e) = self.accessor.node_add_label(node, key, value).await {
                    return StateResult::failed(key, e.to_string());
                }
                let mut new = labels.clone();
                new.insert(key.to_string(), value.to_string());
                info!(node = %node, label = %key, "label set");
                StateResult::applied(key, "", label_change(node, key, &labels, &new))
            }
            Some(current) if current == value => {
                let comment = "The label is already set and has the specified value";
                if test {
                    StateResult::simulated(key, comment)
                } else {
                    StateResult::applied(key, comment, Map::new())
                }
            }
            Some(_) => {
                if test {
                    return StateResult::simulated(key, "The label is going to be updated");
                }
                if let Err(e) = self.accessor.node_add_label(node, key, value).await {
                    return StateResult::failed(key, e.to_string());
                }
                let mut new = labels.clone();
                new.insert(key.to_string(), value.to_string());
                info!(node = %node, label = %key, "label updated");
                StateResult::applied(
                    key,
                    "The label is already set, changing the value",
                    label_change(node, key, &labels, &new),
                )
            }
        }
    }

    /// Ensures the node does not carry the label `key`.
    pub async fn label_absent(&self, node: &str, key: &str, test: bool) -> StateResult {
        counter!("state_apply_attempts", 1u64);
        let labels = match self.accessor.node_labels(node).await {
            Ok(l) => l,
            Err(e) => return StateResult::failed(key, e.to_string()),
        };

        if !labels.contains_key(key) {
            let comment = "The label does not exist";
            return if test {
                StateResult::simulated(key, comment)
            } else {
                StateResult::applied(key, comment, Map::new())
            };
        }
        if test {
            return StateResult::simulated(key, "The label is going to be deleted");
        }
        if let Err(e) = self.accessor.node_remove_label(node, key).await {
            return StateResult::failed(key, e.to_string());
        }
        info!(node = %node, label = %key, "label removed");
        let mut changes = Map::new();
        changes.insert(
            "kubernetes.node_label".into(),
            json!({ "new": "absent", "old": "present" }),
        );
        StateResult::applied(key, "Label removed from node", changes)
    }

    /// Removes every label under the `prefix/` folder from the node.
    pub async fn label_folder_absent(
        &self,
        node: &str,
        prefix: &str,
        test: bool,
    ) -> StateResult {
        counter!("state_apply_attempts", 1u64);
        let folder = format!("{}/", prefix.trim_matches('/'));
        let labels = match self.accessor.node_labels(node).await {
            Ok(l) => l,
            Err(e) => return StateResult::failed(&folder, e.to_string()),
        };

        let doomed: Vec<&String> =
            labels.keys().filter(|k| k.starts_with(&folder)).collect();
        if doomed.is_empty() {
            let comment = "The label folder does not exist";
            return if test {
                StateResult::simulated(&folder, comment)
            } else {
                StateResult::applied(&folder, comment, Map::new())
            };
        }
        if test {
            return StateResult::simulated(&folder, "The label folder is going to be deleted");
        }

        for key in &doomed {
            if let Err(e) = self.accessor.node_remove_label(node, key).await {
                return StateResult::failed(&folder, e.to_string());
            }
        }
        info!(node = %node, folder = %folder, removed = doomed.len(), "label folder removed");
        let remaining: Vec<&String> =
            labels.keys().filter(|k| !k.starts_with(&folder)).collect();
        let mut changes = Map::new();
        changes.insert(
            "kubernetes.node_label_folder_absent".into(),
            json!({ "old": labels.keys().collect::<Vec<_>>(), "new": remaining }),
        );
        StateResult::applied(&folder, "Label folder removed from node", changes)
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::MockAccessor;
    use crate::Engine;
    use kubestate_core::Outcome;
    use serde_json::json;

    const NODE: &str = "worker-1";

    #[tokio::test]
    async fn label_lifecycle_set_update_remove() {
        let mock = MockAccessor::default();
        let engine = Engine::new(&mock);

        let set = engine.label_present(NODE, "zone", "us-east-1a", false).await;
        assert_eq!(set.result, Outcome::Applied);
        assert_eq!(set.comment, "");
        assert_eq!(
            set.changes["worker-1.zone"],
            json!({ "old": {}, "new": {"zone": "us-east-1a"} })
        );

        let same = engine.label_present(NODE, "zone", "us-east-1a", false).await;
        assert_eq!(same.result, Outcome::Applied);
        assert_eq!(same.comment, "The label is already set and has the specified value");
        assert!(same.changes.is_empty());

        let updated = engine.label_present(NODE, "zone", "us-east-1b", false).await;
        assert_eq!(updated.comment, "The label is already set, changing the value");
        assert_eq!(
            updated.changes["worker-1.zone"],
            json!({ "old": {"zone": "us-east-1a"}, "new": {"zone": "us-east-1b"} })
        );

        let removed = engine.label_absent(NODE, "zone", false).await;
        assert_eq!(removed.result, Outcome::Applied);
        assert_eq!(removed.comment, "Label removed from node");
        assert_eq!(
            removed.changes["kubernetes.node_label"],
            json!({ "new": "absent", "old": "present" })
        );

        let gone = engine.label_absent(NODE, "zone", false).await;
        assert_eq!(gone.comment, "The label does not exist");
        assert!(gone.changes.is_empty());
    }

    #[tokio::test]
    async fn label_dry_run_never_mutates() {
        let mock = MockAccessor::default();
        mock.seed_labels(NODE, &[("zone", "us-east-1a")]);
        let engine = Engine::new(&mock);

        let checks = [
            engine.label_present(NODE, "zone", "us-east-1a", true).await,
            engine.label_present(NODE, "zone", "us-east-1b", true).await,
            engine.label_present(NODE, "rack", "r7", true).await,
            engine.label_absent(NODE, "zone", true).await,
            engine.label_folder_absent(NODE, "example.com", true).await,
        ];
        for res in checks {
            assert_eq!(res.result, Outcome::Simulated, "{}", res.comment);
            assert!(res.changes.is_empty(), "{}", res.comment);
        }
        let labels = mock.labels.lock().unwrap();
        assert_eq!(labels[NODE].get("zone").map(String::as_str), Some("us-east-1a"));
        assert_eq!(labels[NODE].len(), 1);
    }

    #[tokio::test]
    async fn label_folder_absent_removes_only_the_folder() {
        let mock = MockAccessor::default();
        mock.seed_labels(
            NODE,
            &[
                ("example.com/tier", "db"),
                ("example.com/zone", "a"),
                ("kubernetes.io/hostname", "worker-1"),
            ],
        );
        let engine = Engine::new(&mock);

        let res = engine.label_folder_absent(NODE, "example.com/", false).await;
        assert_eq!(res.result, Outcome::Applied);
        assert_eq!(res.comment, "Label folder removed from node");
        let change = &res.changes["kubernetes.node_label_folder_absent"];
        assert_eq!(
            change["old"],
            json!(["example.com/tier", "example.com/zone", "kubernetes.io/hostname"])
        );
        assert_eq!(change["new"], json!(["kubernetes.io/hostname"]));

        let repeat = engine.label_folder_absent(NODE, "example.com", false).await;
        assert_eq!(repeat.comment, "The label folder does not exist");
        assert!(repeat.changes.is_empty());
    }
}
