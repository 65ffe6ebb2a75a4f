//! Matching a worker against a [`WorkerSpec`].
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. team: shared workers serve every team, owned workers only their own
//! 2. resource type: the requested type, resolved through the catalog of
//!    custom types, must be provided natively by the worker
//! 3. platform
//! 4. tags: a tagged worker only serves requests naming its tags
//!
//! Nothing here ranks or balances workers: callers get every eligible worker
//! and choose for themselves.

use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::MatchError;
use crate::state::WorkerRepository;
use crate::types::{CustomResourceType, ResourceTypeCatalog, WorkerInfo, WorkerSpec};
use crate::version::{self, Version};
use crate::worker::Worker;

impl WorkerInfo {
    /// Check whether this worker can run work described by `spec`.
    pub fn satisfies(&self, spec: &WorkerSpec) -> Result<(), MatchError> {
        if spec.team_id != self.team_id && !self.team_id.is_unowned() {
            return Err(MatchError::TeamMismatch);
        }

        if let Some(requested) = &spec.resource_type {
            let underlying = determine_underlying_type_name(requested, &spec.resource_types);
            if !self
                .resource_types
                .iter()
                .any(|rt| rt.resource_type == underlying)
            {
                return Err(MatchError::UnsupportedResourceType);
            }
        }

        if let Some(platform) = &spec.platform {
            if *platform != self.platform {
                return Err(MatchError::IncompatiblePlatform);
            }
        }

        if !tags_match(&self.tags, &spec.tags) {
            return Err(MatchError::MismatchedTags);
        }

        Ok(())
    }
}

impl Worker {
    /// Returns this worker if it satisfies `spec`.
    pub fn satisfying(&self, spec: &WorkerSpec) -> Result<&Self, MatchError> {
        match self.info().satisfies(spec) {
            Ok(()) => Ok(self),
            Err(e) => {
                debug!(worker = %self.name(), reason = %e, "Worker does not satisfy spec");
                Err(e)
            }
        }
    }
}

/// All workers satisfying `spec`, in input order. Workers incompatible with
/// `required_version` are skipped first.
pub fn satisfying_workers<'a>(
    workers: &'a [Worker],
    spec: &WorkerSpec,
    required_version: Option<&Version>,
) -> Vec<&'a Worker> {
    workers
        .iter()
        .filter(|w| required_version.map_or(true, |v| w.is_version_compatible(v)))
        .filter_map(|w| w.satisfying(spec).ok())
        .collect()
}

/// Workers satisfying `spec`, gated on the configured required version.
pub fn satisfying_pool<'a>(
    workers: &'a [Worker],
    spec: &WorkerSpec,
    config: &WorkerConfig,
) -> Vec<&'a Worker> {
    satisfying_workers(workers, spec, config.required_worker_version.as_ref())
}

/// Registered workers satisfying `spec`.
pub async fn satisfying_registrations(
    repository: &dyn WorkerRepository,
    spec: &WorkerSpec,
    required_version: Option<&Version>,
) -> Result<Vec<WorkerInfo>> {
    let workers = repository.list_workers().await?;

    Ok(workers
        .into_iter()
        .filter(|w| {
            required_version.map_or(true, |v| version::is_compatible(w.version.as_deref(), v))
        })
        .filter(|w| w.satisfies(spec).is_ok())
        .collect())
}

/// Resolve a resource type name to the base type it is built from.
///
/// Follows `base_type` links through the catalog until reaching a name the
/// catalog does not define. Each visited entry is removed before following
/// its link, so the walk takes at most `catalog.len()` steps even when the
/// catalog contains a cycle.
pub fn determine_underlying_type_name(type_name: &str, catalog: &ResourceTypeCatalog) -> String {
    let mut remaining: HashMap<&str, &CustomResourceType> =
        catalog.iter().map(|rt| (rt.name.as_str(), rt)).collect();

    let mut name = type_name;
    while let Some(resource_type) = remaining.remove(name) {
        name = resource_type.base_type.as_str();
    }

    name.to_string()
}

/// Tags are an access gate: a tagged worker never serves untagged requests,
/// and every requested tag must be present on the worker.
fn tags_match(worker_tags: &[String], requested: &[String]) -> bool {
    if !worker_tags.is_empty() && requested.is_empty() {
        return false;
    }

    requested.iter().all(|tag| worker_tags.contains(tag))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use rstest::rstest;
    use stevedore_id::TeamId;

    use super::*;
    use crate::state::StateStore;
    use crate::types::WorkerResourceType;
    use crate::worker::tests::{test_info, test_worker};

    fn custom(name: &str, base: &str) -> CustomResourceType {
        CustomResourceType {
            name: name.to_string(),
            base_type: base.to_string(),
            source: serde_json::Value::Null,
            privileged: false,
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_satisfies_empty_spec() {
        assert_eq!(test_info("w1").satisfies(&WorkerSpec::default()), Ok(()));
    }

    #[rstest]
    #[case(0, 0, true)]
    #[case(0, 7, true)]
    #[case(7, 7, true)]
    #[case(7, 8, false)]
    #[case(7, 0, false)]
    fn test_team_check(#[case] worker_team: i32, #[case] spec_team: i32, #[case] ok: bool) {
        let mut info = test_info("w1");
        info.team_id = TeamId::new(worker_team);
        let spec = WorkerSpec {
            team_id: TeamId::new(spec_team),
            ..Default::default()
        };

        let expected = if ok { Ok(()) } else { Err(MatchError::TeamMismatch) };
        assert_eq!(info.satisfies(&spec), expected);
    }

    #[test]
    fn test_resource_type_native() {
        let spec = WorkerSpec {
            resource_type: Some("git".to_string()),
            ..Default::default()
        };
        assert_eq!(test_info("w1").satisfies(&spec), Ok(()));
    }

    #[test]
    fn test_resource_type_through_custom_chain() {
        let spec = WorkerSpec {
            resource_type: Some("my-git".to_string()),
            resource_types: [custom("my-git", "team-git"), custom("team-git", "git")]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        assert_eq!(test_info("w1").satisfies(&spec), Ok(()));
    }

    #[test]
    fn test_resource_type_unsupported() {
        let spec = WorkerSpec {
            resource_type: Some("my-s3".to_string()),
            resource_types: [custom("my-s3", "s3")].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(
            test_info("w1").satisfies(&spec),
            Err(MatchError::UnsupportedResourceType)
        );
    }

    #[test]
    fn test_platform_check() {
        let spec = WorkerSpec {
            platform: Some("windows".to_string()),
            ..Default::default()
        };
        assert_eq!(
            test_info("w1").satisfies(&spec),
            Err(MatchError::IncompatiblePlatform)
        );

        let spec = WorkerSpec {
            platform: Some("linux".to_string()),
            ..Default::default()
        };
        assert_eq!(test_info("w1").satisfies(&spec), Ok(()));
    }

    #[rstest]
    #[case(&["gpu"], &[], false)]
    #[case(&["gpu"], &["gpu"], true)]
    #[case(&["gpu", "arm"], &["arm", "gpu"], true)]
    #[case(&["gpu", "arm"], &["arm"], true)]
    #[case(&["gpu"], &["gpu", "arm"], false)]
    #[case(&[], &[], true)]
    #[case(&[], &["gpu"], false)]
    fn test_tag_check(#[case] worker_tags: &[&str], #[case] spec_tags: &[&str], #[case] ok: bool) {
        let mut info = test_info("w1");
        info.tags = strings(worker_tags);
        let spec = WorkerSpec {
            tags: strings(spec_tags),
            ..Default::default()
        };

        let expected = if ok { Ok(()) } else { Err(MatchError::MismatchedTags) };
        assert_eq!(info.satisfies(&spec), expected);
    }

    #[test]
    fn test_first_failing_check_wins() {
        let mut info = test_info("w1");
        info.team_id = TeamId::new(2);
        info.tags = strings(&["gpu"]);

        let spec = WorkerSpec {
            team_id: TeamId::new(1),
            resource_type: Some("s3".to_string()),
            platform: Some("darwin".to_string()),
            tags: vec![],
            ..Default::default()
        };
        assert_eq!(info.satisfies(&spec), Err(MatchError::TeamMismatch));

        info.team_id = TeamId::new(1);
        assert_eq!(info.satisfies(&spec), Err(MatchError::UnsupportedResourceType));

        info.resource_types.push(WorkerResourceType {
            resource_type: "s3".to_string(),
            image: "/opt/resource-types/s3".to_string(),
        });
        assert_eq!(info.satisfies(&spec), Err(MatchError::IncompatiblePlatform));

        info.platform = "darwin".to_string();
        assert_eq!(info.satisfies(&spec), Err(MatchError::MismatchedTags));
    }

    #[test]
    fn test_worker_satisfying_returns_self() {
        let worker = test_worker(test_info("w1"));
        let matched = worker.satisfying(&WorkerSpec::default()).unwrap();
        assert_eq!(matched.name(), "w1");
    }

    #[test]
    fn test_satisfying_workers_filters_version_and_spec() {
        let mut old = test_info("old");
        old.version = Some("1.0.0".to_string());
        let mut tagged = test_info("tagged");
        tagged.tags = strings(&["gpu"]);
        let workers = vec![
            test_worker(test_info("plain")),
            test_worker(old),
            test_worker(tagged),
        ];

        let required: Version = "2.0".parse().unwrap();
        let names: Vec<_> = satisfying_workers(&workers, &WorkerSpec::default(), Some(&required))
            .into_iter()
            .map(|w| w.name().to_string())
            .collect();
        assert_eq!(names, vec!["plain"]);
    }

    #[test]
    fn test_satisfying_pool_uses_configured_version() {
        let mut old = test_info("old");
        old.version = Some("1.0.0".to_string());
        let workers = vec![test_worker(old), test_worker(test_info("current"))];

        let config = WorkerConfig {
            required_worker_version: Some("2.0".parse().unwrap()),
            ..WorkerConfig::default()
        };
        let names: Vec<_> = satisfying_pool(&workers, &WorkerSpec::default(), &config)
            .into_iter()
            .map(|w| w.name().to_string())
            .collect();
        assert_eq!(names, vec!["current"]);

        let ungated = satisfying_pool(&workers, &WorkerSpec::default(), &WorkerConfig::default());
        assert_eq!(ungated.len(), 2);
    }

    #[tokio::test]
    async fn test_satisfying_registrations() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut arm = test_info("arm");
        arm.platform = "linux-arm".to_string();
        store.save_worker(&arm).unwrap();
        store.save_worker(&test_info("x86")).unwrap();

        let spec = WorkerSpec {
            platform: Some("linux".to_string()),
            ..Default::default()
        };
        let matched = satisfying_registrations(store.as_ref(), &spec, None)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "x86");
    }

    #[test]
    fn test_underlying_type_of_native_name() {
        assert_eq!(
            determine_underlying_type_name("git", &ResourceTypeCatalog::new()),
            "git"
        );
    }

    #[test]
    fn test_underlying_type_terminates_on_cycle() {
        let catalog: ResourceTypeCatalog = [custom("a", "b"), custom("b", "a")]
            .into_iter()
            .collect();
        assert_eq!(determine_underlying_type_name("a", &catalog), "a");
    }

    #[test]
    fn test_underlying_type_terminates_on_self_reference() {
        let catalog: ResourceTypeCatalog = [custom("a", "a")].into_iter().collect();
        assert_eq!(determine_underlying_type_name("a", &catalog), "a");
    }

    proptest! {
        #[test]
        fn prop_chain_resolves_to_terminal(len in 1usize..12) {
            // t0 -> t1 -> ... -> t{len-1} -> base
            let catalog: ResourceTypeCatalog = (0..len)
                .map(|i| {
                    let base = if i + 1 == len { "base".to_string() } else { format!("t{}", i + 1) };
                    custom(&format!("t{i}"), &base)
                })
                .collect();
            prop_assert_eq!(determine_underlying_type_name("t0", &catalog), "base");
        }

        #[test]
        fn prop_arbitrary_catalog_terminates(
            links in proptest::collection::vec((0u8..6, 0u8..8), 0..12),
            start in 0u8..8,
        ) {
            let catalog: ResourceTypeCatalog = links
                .iter()
                .map(|(from, to)| custom(&format!("t{from}"), &format!("t{to}")))
                .collect();

            let resolved = determine_underlying_type_name(&format!("t{start}"), &catalog);

            // Either a base type, or the point where a cycle was cut.
            let base_or_cycle = catalog.get(&resolved).is_none()
                || catalog.iter().any(|rt| rt.base_type == resolved);
            prop_assert!(base_or_cycle);
        }
    }
}
