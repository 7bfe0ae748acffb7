//! The task/group forest a run is configured with.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorDetails};
use crate::task::Task;

/// How a group folds its subtasks' values of one metric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupAggregation {
    #[default]
    Mean,
}

fn default_filter_list() -> Vec<String> {
    vec!["none".to_string()]
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AggregateMetricConfig {
    pub metric: String,
    #[serde(default)]
    pub aggregation: GroupAggregation,
    #[serde(default)]
    pub weight_by_size: bool,
    #[serde(default = "default_filter_list")]
    pub filter_list: Vec<String>,
}

impl AggregateMetricConfig {
    /// Whether the result key `metric,filter` is aggregated by this entry.
    pub fn matches(&self, metric_key: &str) -> bool {
        self.filter_list
            .iter()
            .any(|filter| metric_key == format!("{},{filter}", self.metric))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GroupConfig {
    pub group_alias: Option<String>,
    /// Without a list the group only appears as a header row.
    pub aggregate_metric_list: Option<Vec<AggregateMetricConfig>>,
    pub metadata: Map<String, Value>,
}

pub struct TaskGroup {
    pub name: String,
    pub config: Option<GroupConfig>,
    pub children: Vec<TaskEntry>,
}

/// A node of the task forest as supplied by the caller.
pub enum TaskEntry {
    Task(Box<dyn Task>),
    Group(TaskGroup),
}

impl TaskEntry {
    pub fn group(
        name: impl Into<String>,
        config: Option<GroupConfig>,
        children: Vec<TaskEntry>,
    ) -> Self {
        TaskEntry::Group(TaskGroup {
            name: name.into(),
            config,
            children,
        })
    }

    pub fn task(task: impl Task + 'static) -> Self {
        TaskEntry::Task(Box::new(task))
    }

    fn name(&self) -> &str {
        match self {
            TaskEntry::Task(task) => task.name(),
            TaskEntry::Group(group) => &group.name,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Task,
    Group(Option<GroupConfig>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HierarchyNode {
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

/// A flattened view of the forest keyed by name, in registration (depth-first) order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskHierarchy {
    nodes: IndexMap<String, HierarchyNode>,
    roots: Vec<String>,
}

/// A leaf task and the group it was registered under.
pub struct LeafTask {
    pub task: Box<dyn Task>,
    pub group_name: Option<String>,
}

impl TaskHierarchy {
    /// Splits the forest into its structure and its leaf tasks. Names must be unique.
    pub fn flatten(entries: Vec<TaskEntry>) -> Result<(Self, Vec<LeafTask>), Error> {
        let mut hierarchy = Self::default();
        let mut leaves = Vec::new();
        for entry in entries {
            hierarchy.roots.push(entry.name().to_string());
            hierarchy.insert(entry, None, &mut leaves)?;
        }
        Ok((hierarchy, leaves))
    }

    fn insert(
        &mut self,
        entry: TaskEntry,
        parent: Option<&str>,
        leaves: &mut Vec<LeafTask>,
    ) -> Result<(), Error> {
        let name = entry.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(Error::new(ErrorDetails::DuplicateTaskName { name }));
        }
        match entry {
            TaskEntry::Task(task) => {
                self.nodes.insert(
                    name.clone(),
                    HierarchyNode {
                        name,
                        kind: NodeKind::Task,
                        parent: parent.map(str::to_string),
                        children: Vec::new(),
                    },
                );
                leaves.push(LeafTask {
                    task,
                    group_name: parent.map(str::to_string),
                });
            }
            TaskEntry::Group(group) => {
                let children = group
                    .children
                    .iter()
                    .map(|child| child.name().to_string())
                    .collect();
                self.nodes.insert(
                    name.clone(),
                    HierarchyNode {
                        name: name.clone(),
                        kind: NodeKind::Group(group.config),
                        parent: parent.map(str::to_string),
                        children,
                    },
                );
                for child in group.children {
                    self.insert(child, Some(&name), leaves)?;
                }
            }
        }
        Ok(())
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn get(&self, name: &str) -> Option<&HierarchyNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &HierarchyNode> {
        self.nodes.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&HierarchyNode, Option<&GroupConfig>)> {
        self.nodes.values().filter_map(|node| match &node.kind {
            NodeKind::Group(config) => Some((node, config.as_ref())),
            NodeKind::Task => None,
        })
    }

    /// Presentation depth: roots are 0 and each child sits one below its parent.
    pub fn task_order(&self) -> IndexMap<String, usize> {
        let mut order: IndexMap<String, usize> = IndexMap::new();
        for node in self.nodes.values() {
            let own = *order.entry(node.name.clone()).or_insert(0);
            for child in &node.children {
                order.insert(child.clone(), own + 1);
            }
        }
        order
    }

    /// All leaf tasks below `name`, depth first. A leaf task is its own only descendant.
    pub fn leaf_descendants(&self, name: &str) -> Vec<&str> {
        let mut leaves = Vec::new();
        self.collect_leaves(name, &mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, name: &str, leaves: &mut Vec<&'a str>) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        match node.kind {
            NodeKind::Task => leaves.push(&node.name),
            NodeKind::Group(_) => {
                for child in &node.children {
                    self.collect_leaves(child, leaves);
                }
            }
        }
    }

    /// Direct children of every group, plus an empty list for every root task, in
    /// registration order.
    pub fn subtask_list(&self) -> IndexMap<String, Vec<String>> {
        self.nodes
            .values()
            .filter(|node| matches!(node.kind, NodeKind::Group(_)) || node.parent.is_none())
            .map(|node| (node.name.clone(), node.children.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ExactMatchTask;

    fn forest() -> Vec<TaskEntry> {
        vec![
            TaskEntry::group(
                "mmmu",
                None,
                vec![
                    TaskEntry::task(ExactMatchTask::new("mmmu_art", &["a"])),
                    TaskEntry::group(
                        "mmmu_science",
                        None,
                        vec![
                            TaskEntry::task(ExactMatchTask::new("mmmu_physics", &["a"])),
                            TaskEntry::task(ExactMatchTask::new("mmmu_chemistry", &["a"])),
                        ],
                    ),
                ],
            ),
            TaskEntry::task(ExactMatchTask::new("mme", &["a"])),
        ]
    }

    #[test]
    fn test_flatten_returns_leaves_with_parents() {
        let (hierarchy, leaves) = TaskHierarchy::flatten(forest()).unwrap();
        let leaves: Vec<(String, Option<String>)> = leaves
            .iter()
            .map(|leaf| (leaf.task.name().to_string(), leaf.group_name.clone()))
            .collect();
        assert_eq!(
            leaves,
            vec![
                ("mmmu_art".to_string(), Some("mmmu".to_string())),
                ("mmmu_physics".to_string(), Some("mmmu_science".to_string())),
                ("mmmu_chemistry".to_string(), Some("mmmu_science".to_string())),
                ("mme".to_string(), None),
            ]
        );
        assert_eq!(hierarchy.roots(), ["mmmu".to_string(), "mme".to_string()]);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let entries = vec![
            TaskEntry::task(ExactMatchTask::new("mme", &["a"])),
            TaskEntry::group(
                "g",
                None,
                vec![TaskEntry::task(ExactMatchTask::new("mme", &["a"]))],
            ),
        ];
        let error = TaskHierarchy::flatten(entries).err().unwrap();
        assert!(matches!(
            error.get_details(),
            ErrorDetails::DuplicateTaskName { name } if name == "mme"
        ));
    }

    #[test]
    fn test_task_order_follows_depth() {
        let (hierarchy, _) = TaskHierarchy::flatten(forest()).unwrap();
        let order = hierarchy.task_order();
        assert_eq!(order["mmmu"], 0);
        assert_eq!(order["mmmu_art"], 1);
        assert_eq!(order["mmmu_science"], 1);
        assert_eq!(order["mmmu_physics"], 2);
        assert_eq!(order["mme"], 0);
    }

    #[test]
    fn test_leaf_descendants_and_subtask_list() {
        let (hierarchy, _) = TaskHierarchy::flatten(forest()).unwrap();
        assert_eq!(
            hierarchy.leaf_descendants("mmmu"),
            vec!["mmmu_art", "mmmu_physics", "mmmu_chemistry"]
        );
        assert_eq!(hierarchy.leaf_descendants("mme"), vec!["mme"]);
        let subtasks = hierarchy.subtask_list();
        assert_eq!(
            subtasks.keys().collect::<Vec<_>>(),
            vec!["mmmu", "mmmu_science", "mme"]
        );
        assert_eq!(subtasks["mmmu"], vec!["mmmu_art", "mmmu_science"]);
        assert!(subtasks["mme"].is_empty());
    }

    #[test]
    fn test_aggregate_metric_config_defaults() {
        let config: GroupConfig = serde_json::from_value(serde_json::json!({
            "aggregate_metric_list": [{"metric": "acc"}]
        }))
        .unwrap();
        let entry = &config.aggregate_metric_list.unwrap()[0];
        assert!(entry.matches("acc,none"));
        assert!(!entry.matches("acc,strict"));
        assert!(!entry.weight_by_size);
    }
}
