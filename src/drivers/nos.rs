//! Network operating system (switch firmware) catalog.
//!
//! Purely descriptive: the region asks which NOS flavors this rack can
//! deploy and shows them in its UI. There is no action contract here.

use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct NosType {
    pub name: String,
    pub description: String,
    pub deployable: bool,
}

pub struct NosRegistry {
    types: BTreeMap<String, NosType>,
}

impl NosRegistry {
    pub fn new(types: Vec<NosType>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(vec![NosType {
            name: "flexswitch".into(),
            description: "FlexSwitch".into(),
            deployable: false,
        }])
    }

    pub fn describe(&self) -> Vec<Value> {
        self.types
            .values()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "deployable": t.deployable,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_stable_and_sorted() {
        let registry = NosRegistry::new(vec![
            NosType {
                name: "zephyr".into(),
                description: "Zephyr".into(),
                deployable: true,
            },
            NosType {
                name: "flexswitch".into(),
                description: "FlexSwitch".into(),
                deployable: false,
            },
        ]);
        let names: Vec<String> = registry
            .describe()
            .iter()
            .filter_map(|t| t["name"].as_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["flexswitch", "zephyr"]);
    }
}
