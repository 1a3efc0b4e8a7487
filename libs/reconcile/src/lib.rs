//! Reconciliation of per-area child deployments.
//!
//! A blueprint that manages child resources per area (a router and a
//! data-plane function for each edge area, for example) keeps two maps:
//!
//! - **Desired**: area key -> descriptor, from the blueprint's current config.
//! - **Deployed**: area key -> what was deployed there, including the config
//!   that was last applied to it.
//!
//! [`reconcile`] converges deployed towards desired in one pass:
//!
//! ```text
//! to_add    = desired - deployed   -> deploy, record under the area key
//! to_check  = desired ∩ deployed   -> recompute target config, update only if it changed
//! to_remove = deployed - desired   -> tear down, drop the area key
//! ```
//!
//! # Invariants
//!
//! - Removals run after every add and update of the pass.
//! - An unchanged config (value comparison) never produces an update.
//! - An area whose teardown fails stays in the deployed map.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors, tagged with the area and step that failed.
#[derive(Debug, Error)]
pub enum ReconcileError<E> {
    /// Deploying children for a new area failed.
    #[error("deploying area {area}: {source}")]
    Deploy {
        area: String,
        #[source]
        source: E,
    },

    /// Computing or pushing an updated config failed.
    #[error("updating area {area}: {source}")]
    Update {
        area: String,
        #[source]
        source: E,
    },

    /// Tearing down a removed area failed.
    #[error("tearing down area {area}: {source}")]
    Teardown {
        area: String,
        #[source]
        source: E,
    },
}

impl<E> ReconcileError<E> {
    /// The area the failing step was working on.
    pub fn area(&self) -> &str {
        match self {
            Self::Deploy { area, .. } | Self::Update { area, .. } | Self::Teardown { area, .. } => {
                area
            }
        }
    }
}

/// A config hash for logging and cheap equality checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a hash from canonical JSON (key order does not matter).
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String((*k).clone()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// The three-way split of desired and deployed area keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaPlan<K> {
    pub to_add: Vec<K>,
    pub to_check: Vec<K>,
    pub to_remove: Vec<K>,
}

/// Split area keys into add / check / remove sets, each sorted.
pub fn plan_areas<K, D, P>(desired: D, deployed: P) -> AreaPlan<K>
where
    K: Ord + Clone,
    D: IntoIterator<Item = K>,
    P: IntoIterator<Item = K>,
{
    let desired: BTreeSet<K> = desired.into_iter().collect();
    let deployed: BTreeSet<K> = deployed.into_iter().collect();

    AreaPlan {
        to_add: desired.difference(&deployed).cloned().collect(),
        to_check: desired.intersection(&deployed).cloned().collect(),
        to_remove: deployed.difference(&desired).cloned().collect(),
    }
}

/// Domain operations the reconciliation pass drives.
#[async_trait]
pub trait EdgeReconciler: Send {
    /// Area key.
    type Area: Ord + Clone + Display + Send + Sync;
    /// Desired descriptor for one area.
    type Desired: Send + Sync;
    /// What is deployed in one area.
    type Deployed: Send + Sync;
    /// Config pushed to the area's children.
    type Config: PartialEq + Send;
    type Error: std::error::Error + Send + 'static;

    /// Recompute the target config of an area from its desired descriptor.
    fn target_config(
        &self,
        area: &Self::Area,
        desired: &Self::Desired,
    ) -> Result<Self::Config, Self::Error>;

    /// Config last applied to the area's children.
    fn applied_config<'d>(&self, deployed: &'d Self::Deployed) -> &'d Self::Config;

    /// Deploy every child an area needs.
    async fn deploy(
        &mut self,
        area: &Self::Area,
        desired: &Self::Desired,
        config: Self::Config,
    ) -> Result<Self::Deployed, Self::Error>;

    /// Push a changed config to an already deployed area and record it.
    async fn update(
        &mut self,
        area: &Self::Area,
        deployed: &mut Self::Deployed,
        config: Self::Config,
    ) -> Result<(), Self::Error>;

    /// Tear down an area's children.
    async fn teardown(
        &mut self,
        area: &Self::Area,
        deployed: &Self::Deployed,
    ) -> Result<(), Self::Error>;
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport<K> {
    pub deployed: Vec<K>,
    pub updated: Vec<K>,
    pub unchanged: Vec<K>,
    pub removed: Vec<K>,
}

impl<K> Default for ReconcileReport<K> {
    fn default() -> Self {
        Self {
            deployed: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<K> ReconcileReport<K> {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.deployed.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Run one reconciliation pass.
///
/// `deployed` is updated in place after every successful step, so a failure
/// part-way through leaves it describing what actually exists.
pub async fn reconcile<R>(
    reconciler: &mut R,
    desired: &BTreeMap<R::Area, R::Desired>,
    deployed: &mut BTreeMap<R::Area, R::Deployed>,
) -> Result<ReconcileReport<R::Area>, ReconcileError<R::Error>>
where
    R: EdgeReconciler,
{
    let plan = plan_areas(desired.keys().cloned(), deployed.keys().cloned());
    let mut report = ReconcileReport::default();

    for area in plan.to_add {
        let Some(descriptor) = desired.get(&area) else {
            continue;
        };
        let children = match reconciler.target_config(&area, descriptor) {
            Ok(config) => reconciler.deploy(&area, descriptor, config).await,
            Err(e) => Err(e),
        }
        .map_err(|source| ReconcileError::Deploy {
            area: area.to_string(),
            source,
        })?;
        deployed.insert(area.clone(), children);
        report.deployed.push(area);
    }

    for area in plan.to_check {
        let (Some(descriptor), Some(children)) = (desired.get(&area), deployed.get_mut(&area))
        else {
            continue;
        };
        let config = match reconciler.target_config(&area, descriptor) {
            Ok(config) => config,
            Err(source) => {
                return Err(ReconcileError::Update {
                    area: area.to_string(),
                    source,
                })
            }
        };
        if *reconciler.applied_config(children) == config {
            report.unchanged.push(area);
            continue;
        }
        if let Err(source) = reconciler.update(&area, children, config).await {
            return Err(ReconcileError::Update {
                area: area.to_string(),
                source,
            });
        }
        report.updated.push(area);
    }

    for area in plan.to_remove {
        let Some(children) = deployed.get(&area) else {
            continue;
        };
        reconciler
            .teardown(&area, children)
            .await
            .map_err(|source| ReconcileError::Teardown {
                area: area.to_string(),
                source,
            })?;
        deployed.remove(&area);
        report.removed.push(area);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct FakeError(String);

    #[derive(Debug, Clone)]
    struct FakeDeployed {
        applied: String,
        generation: u32,
    }

    /// Records every call; area 99 always fails to tear down.
    #[derive(Default)]
    struct FakeReconciler {
        calls: Vec<String>,
    }

    #[async_trait]
    impl EdgeReconciler for FakeReconciler {
        type Area = u32;
        type Desired = String;
        type Deployed = FakeDeployed;
        type Config = String;
        type Error = FakeError;

        fn target_config(&self, area: &u32, desired: &String) -> Result<String, FakeError> {
            Ok(format!("{area}:{desired}"))
        }

        fn applied_config<'d>(&self, deployed: &'d FakeDeployed) -> &'d String {
            &deployed.applied
        }

        async fn deploy(
            &mut self,
            area: &u32,
            _desired: &String,
            config: String,
        ) -> Result<FakeDeployed, FakeError> {
            self.calls.push(format!("deploy {area}"));
            Ok(FakeDeployed {
                applied: config,
                generation: 0,
            })
        }

        async fn update(
            &mut self,
            area: &u32,
            deployed: &mut FakeDeployed,
            config: String,
        ) -> Result<(), FakeError> {
            self.calls.push(format!("update {area}"));
            deployed.applied = config;
            deployed.generation += 1;
            Ok(())
        }

        async fn teardown(&mut self, area: &u32, _deployed: &FakeDeployed) -> Result<(), FakeError> {
            self.calls.push(format!("teardown {area}"));
            if *area == 99 {
                return Err(FakeError("router busy".to_string()));
            }
            Ok(())
        }
    }

    fn deployed_with(areas: &[(u32, &str)]) -> BTreeMap<u32, FakeDeployed> {
        areas
            .iter()
            .map(|(area, applied)| {
                (
                    *area,
                    FakeDeployed {
                        applied: applied.to_string(),
                        generation: 0,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_plan_areas() {
        let plan = plan_areas([1, 2], [1, 3]);
        assert_eq!(plan.to_add, vec![2]);
        assert_eq!(plan.to_check, vec![1]);
        assert_eq!(plan.to_remove, vec![3]);
    }

    #[tokio::test]
    async fn test_reconcile_unchanged_area_untouched() {
        let mut reconciler = FakeReconciler::default();
        let desired = BTreeMap::from([(1, "a".to_string()), (2, "b".to_string())]);
        let mut deployed = deployed_with(&[(1, "1:a"), (3, "3:c")]);

        let report = reconcile(&mut reconciler, &desired, &mut deployed)
            .await
            .unwrap();

        assert_eq!(report.deployed, vec![2]);
        assert_eq!(report.unchanged, vec![1]);
        assert_eq!(report.removed, vec![3]);
        assert!(report.updated.is_empty());
        assert_eq!(reconciler.calls, vec!["deploy 2", "teardown 3"]);
        assert_eq!(deployed.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reconcile_changed_area_updated_not_redeployed() {
        let mut reconciler = FakeReconciler::default();
        let desired = BTreeMap::from([(1, "new".to_string()), (2, "b".to_string())]);
        let mut deployed = deployed_with(&[(1, "1:old"), (3, "3:c")]);

        let report = reconcile(&mut reconciler, &desired, &mut deployed)
            .await
            .unwrap();

        assert_eq!(report.updated, vec![1]);
        assert_eq!(reconciler.calls, vec!["deploy 2", "update 1", "teardown 3"]);
        assert_eq!(deployed[&1].applied, "1:new");
        assert_eq!(deployed[&1].generation, 1);
    }

    #[tokio::test]
    async fn test_removals_run_last() {
        let mut reconciler = FakeReconciler::default();
        let desired = BTreeMap::from([(5, "x".to_string())]);
        let mut deployed = deployed_with(&[(1, "1:a")]);

        reconcile(&mut reconciler, &desired, &mut deployed)
            .await
            .unwrap();

        assert_eq!(reconciler.calls, vec!["deploy 5", "teardown 1"]);
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_area() {
        let mut reconciler = FakeReconciler::default();
        let desired = BTreeMap::new();
        let mut deployed = deployed_with(&[(99, "99:a")]);

        let err = reconcile(&mut reconciler, &desired, &mut deployed)
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Teardown { .. }));
        assert_eq!(err.area(), "99");
        assert!(deployed.contains_key(&99));
    }

    #[tokio::test]
    async fn test_converged_pass_is_noop() {
        let mut reconciler = FakeReconciler::default();
        let desired = BTreeMap::from([(1, "a".to_string())]);
        let mut deployed = deployed_with(&[(1, "1:a")]);

        let report = reconcile(&mut reconciler, &desired, &mut deployed)
            .await
            .unwrap();
        assert!(report.is_noop());
        assert!(reconciler.calls.is_empty());
    }

    #[test]
    fn test_spec_hash_ignores_key_order() {
        let a = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "s"}});
        let b = serde_json::json!({"a": {"x": "s", "y": [1, 2]}, "b": 2});
        assert_eq!(SpecHash::from_json(&a), SpecHash::from_json(&b));
        assert_ne!(
            SpecHash::from_json(&a),
            SpecHash::from_json(&serde_json::json!({"b": 3}))
        );
    }

    proptest! {
        #[test]
        fn plan_partitions_both_sets(
            desired in proptest::collection::btree_set(0u32..32, 0..16),
            deployed in proptest::collection::btree_set(0u32..32, 0..16),
        ) {
            let plan = plan_areas(desired.iter().copied(), deployed.iter().copied());

            let mut desired_again: BTreeSet<u32> = plan.to_add.iter().copied().collect();
            desired_again.extend(plan.to_check.iter().copied());
            prop_assert_eq!(&desired_again, &desired);

            let mut deployed_again: BTreeSet<u32> = plan.to_remove.iter().copied().collect();
            deployed_again.extend(plan.to_check.iter().copied());
            prop_assert_eq!(&deployed_again, &deployed);

            for area in &plan.to_add {
                prop_assert!(!deployed.contains(area));
            }
            for area in &plan.to_remove {
                prop_assert!(!desired.contains(area));
            }
        }
    }
}
