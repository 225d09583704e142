use crate::error::DispatchError;
use shared::types::{LoadEstimate, NodeId, Task};

/// What the coordinator knows about one placement candidate at decision
/// time. Built from its own health table plus its local load reporter.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub id: NodeId,
    pub location: String,
    pub load: LoadEstimate,
    pub alive: bool,
}

/// Pure placement policy. Given the same task and the same candidate
/// views it always returns the same node, so placement is reproducible
/// from a log of inputs.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    offload_threshold: u8,
}

impl DispatchPolicy {
    pub fn new(offload_threshold: u8) -> Self {
        Self { offload_threshold }
    }

    /// Picks the node a task runs on.
    ///
    /// Candidates that are not alive are discarded first. If the task
    /// carries a location tag and any survivor matches it, placement is
    /// restricted to the matching nodes. An untagged task stays on the
    /// coordinator while its own load is known and under the offload
    /// threshold. Otherwise the least loaded candidate wins, with
    /// unknown load ranked worse than any measured value and ties broken
    /// by lexical node id.
    pub fn assign(
        &self,
        task: &Task,
        self_id: &NodeId,
        candidates: &[NodeView],
    ) -> Result<NodeId, DispatchError> {
        let mut eligible: Vec<&NodeView> = candidates.iter().filter(|n| n.alive).collect();
        if eligible.is_empty() {
            return Err(DispatchError::NoEligibleNode);
        }

        if let Some(tag) = &task.location {
            let affine: Vec<&NodeView> =
                eligible.iter().copied().filter(|n| &n.location == tag).collect();
            if !affine.is_empty() {
                eligible = affine;
            }
        } else if let Some(me) = eligible.iter().find(|n| &n.id == self_id) {
            if let LoadEstimate::Known(load) = me.load {
                if load < self.offload_threshold {
                    return Ok(me.id.clone());
                }
            }
        }

        eligible
            .into_iter()
            .min_by(|a, b| a.load.rank().cmp(&b.load.rank()).then_with(|| a.id.cmp(&b.id)))
            .map(|n| n.id.clone())
            .ok_or(DispatchError::NoEligibleNode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::types::{TaskType, Urgency};

    fn view(id: &str, location: &str, load: LoadEstimate, alive: bool) -> NodeView {
        NodeView {
            id: id.into(),
            location: location.into(),
            load,
            alive,
        }
    }

    fn untagged() -> Task {
        Task::new(TaskType::Reasoning, json!({}), Urgency::Normal, None)
    }

    fn tagged(location: &str) -> Task {
        Task::new(
            TaskType::SensorManagement,
            json!({}),
            Urgency::Normal,
            Some(location.into()),
        )
    }

    #[test]
    fn saturated_coordinator_offloads_to_least_loaded() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(85), true),
            view("office", "office", LoadEstimate::Known(40), true),
            view("kitchen", "kitchen", LoadEstimate::Known(90), true),
        ];

        let chosen = policy.assign(&untagged(), &me, &candidates).unwrap();
        assert_eq!(chosen, "office");
    }

    #[test]
    fn idle_coordinator_keeps_untagged_tasks() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(20), true),
            view("office", "office", LoadEstimate::Known(5), true),
        ];

        let chosen = policy.assign(&untagged(), &me, &candidates).unwrap();
        assert_eq!(chosen, "supervisor");
    }

    #[test]
    fn location_tag_overrides_local_preference() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(10), true),
            view("kitchen", "kitchen", LoadEstimate::Known(95), true),
        ];

        let chosen = policy.assign(&tagged("kitchen"), &me, &candidates).unwrap();
        assert_eq!(chosen, "kitchen");
    }

    #[test]
    fn dead_affine_node_falls_back_to_general_pool() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(85), true),
            view("kitchen", "kitchen", LoadEstimate::Known(10), false),
            view("office", "office", LoadEstimate::Known(40), true),
        ];

        let chosen = policy.assign(&tagged("kitchen"), &me, &candidates).unwrap();
        assert_eq!(chosen, "office");
    }

    #[test]
    fn unknown_load_loses_to_any_known_load() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(99), true),
            view("office", "office", LoadEstimate::Unknown, true),
        ];

        let chosen = policy.assign(&untagged(), &me, &candidates).unwrap();
        assert_eq!(chosen, "supervisor");
    }

    #[test]
    fn load_tie_breaks_on_lexical_id() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(80), true),
            view("office", "office", LoadEstimate::Known(50), true),
            view("kitchen", "kitchen", LoadEstimate::Known(50), true),
        ];

        let chosen = policy.assign(&untagged(), &me, &candidates).unwrap();
        assert_eq!(chosen, "kitchen");
    }

    #[test]
    fn no_alive_candidates_is_an_error() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(10), false),
            view("office", "office", LoadEstimate::Known(10), false),
            view("kitchen", "kitchen", LoadEstimate::Known(10), false),
        ];

        let err = policy.assign(&untagged(), &me, &candidates).unwrap_err();
        assert_eq!(err, DispatchError::NoEligibleNode);
    }

    #[test]
    fn identical_inputs_give_identical_placement() {
        let policy = DispatchPolicy::new(70);
        let me: NodeId = "supervisor".into();
        let candidates = vec![
            view("supervisor", "hallway", LoadEstimate::Known(75), true),
            view("office", "office", LoadEstimate::Unknown, true),
            view("kitchen", "kitchen", LoadEstimate::Known(75), true),
        ];

        let task = untagged();
        let first = policy.assign(&task, &me, &candidates).unwrap();
        for _ in 0..10 {
            assert_eq!(policy.assign(&task, &me, &candidates).unwrap(), first);
        }
    }
}
