//! Unit tests for encryption-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.
//!
//! Test code is allowed to use expect() for error handling
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod crd_tests {
    use encryption_operator::crd::{Condition, DEGRADED_CONDITION, PROGRESSING_CONDITION};

    #[test]
    fn test_condition_types() {
        let degraded = Condition::degraded(true, "Error", "migration failed", Some(1));
        assert_eq!(degraded.r#type, DEGRADED_CONDITION);
        assert_eq!(degraded.status, "True");
        assert_eq!(degraded.reason, "Error");
        assert_eq!(degraded.observed_generation, Some(1));

        let progressing = Condition::progressing(false, "AsExpected", "", None);
        assert_eq!(progressing.r#type, PROGRESSING_CONDITION);
        assert_eq!(progressing.status, "False");
    }

    #[test]
    fn test_condition_carries_transition_time() {
        let condition = Condition::degraded(false, "AsExpected", "", None);
        assert!(!condition.last_transition_time.is_empty());
        assert!(
            condition
                .last_transition_time
                .parse::<jiff::Timestamp>()
                .is_ok()
        );
    }
}

mod state_tests {
    use encryption_operator::state::{GroupResource, grs_to_human_readable};

    #[test]
    fn test_empty_group_renders_as_core() {
        assert_eq!(GroupResource::new("", "secrets").to_string(), "core/secrets");
    }

    #[test]
    fn test_human_readable_list() {
        let grs = vec![
            GroupResource::new("apps", "deployments"),
            GroupResource::new("", "secrets"),
        ];
        assert_eq!(
            grs_to_human_readable(&grs),
            "[apps/deployments, core/secrets]"
        );
    }

    #[test]
    fn test_config_id_for_core_group_omits_group() {
        assert_eq!(GroupResource::new("", "secrets").config_id(), "secrets");
        assert_eq!(
            GroupResource::new("apps", "deployments").config_id(),
            "deployments.apps"
        );
    }
}

mod status_tests {
    use encryption_operator::controller::status::{is_condition_true, merge_conditions};
    use encryption_operator::crd::{Condition, DEGRADED_CONDITION};

    #[test]
    fn test_merge_then_query() {
        let (merged, changed) = merge_conditions(
            &[],
            vec![
                Condition::degraded(true, "Error", "boom", None),
                Condition::progressing(false, "AsExpected", "", None),
            ],
        );
        assert!(changed);
        assert!(is_condition_true(&merged, DEGRADED_CONDITION));
    }

    #[test]
    fn test_repeated_merge_is_quiet() {
        let desired = || vec![Condition::degraded(false, "AsExpected", "", Some(3))];
        let (merged, _) = merge_conditions(&[], desired());
        let (_, changed) = merge_conditions(&merged, desired());
        assert!(!changed);
    }
}

mod annotation_tests {
    use encryption_operator::secrets::{
        MIGRATED_RESOURCES_ANNOTATION, MIGRATED_TIMESTAMP_ANNOTATION, set_resource_migrated,
    };
    use encryption_operator::state::{GroupResource, MigratedGroupResources};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn key_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("encryption-key-apiserver-1".to_string()),
                namespace: Some("encryption-managed".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_annotation_json_round_trips_the_set() {
        let mut secret = key_secret();
        let grs = [
            GroupResource::new("", "secrets"),
            GroupResource::new("apps", "deployments"),
        ];
        for gr in &grs {
            assert!(set_resource_migrated(gr, &mut secret).unwrap());
        }

        let raw = &secret.metadata.annotations.as_ref().unwrap()[MIGRATED_RESOURCES_ANNOTATION];
        let decoded: MigratedGroupResources = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.resources, grs);
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let mut secret = key_secret();
        set_resource_migrated(&GroupResource::new("", "secrets"), &mut secret).unwrap();
        let raw =
            &secret.metadata.annotations.as_ref().unwrap()[MIGRATED_TIMESTAMP_ANNOTATION];
        assert!(raw.parse::<jiff::Timestamp>().is_ok());
    }
}
