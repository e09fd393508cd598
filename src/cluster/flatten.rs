/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cluster/flatten.rs
 *
 * The wildcard flattener: expands a policy-rule triple (verb, resource,
 * apiGroup), any field of which may be `*`, into concrete descriptors over
 * the discovery cache. Pure function over its inputs; it never consults the
 * cluster.
 *
 * Verb semantics: the eight standard verbs apply to every resource type.
 * Non-standard verbs only apply to their whitelisted resources. A wildcard
 * resource with a concrete standard verb therefore matches every resource,
 * an over-approximation of RBAC (which would require the verb to be served
 * by the resource), kept so the table errs on the side of reporting a
 * grant.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use super::discovery::ResourceDescriptor;

/// Verbs every resource type admits.
pub const STANDARD_VERBS: [&str; 8] = [
    "create",
    "delete",
    "deletecollection",
    "get",
    "list",
    "patch",
    "update",
    "watch",
];

/// Non-standard verbs keyed by the resource types that admit them.
const EXTRA_VERBS: [(&str, &[&str]); 6] = [
    ("certificatesigningrequests", &["approve", "sign"]),
    ("roles", &["bind", "escalate"]),
    ("clusterroles", &["bind", "escalate"]),
    ("serviceaccounts", &["impersonate"]),
    ("users", &["impersonate"]),
    ("groups", &["impersonate"]),
];

/// A concrete `(apiGroup, resource, verb)` triple produced by flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedPermission {
    pub api_group: String,
    pub resource: String,
    pub verb: String,
    pub namespaced: bool,
}

/// All verbs a resource type admits: the standard set plus any whitelisted
/// non-standard verbs.
pub fn verbs_for_resource(resource: &str) -> Vec<&'static str> {
    let mut verbs: Vec<&'static str> = EXTRA_VERBS
        .iter()
        .find(|(r, _)| *r == resource)
        .map(|(_, extra)| extra.to_vec())
        .unwrap_or_default();
    verbs.extend(STANDARD_VERBS);
    verbs
}

/// Whether `resource` admits `verb`. Standard verbs match everything.
pub fn resource_admits_verb(resource: &str, verb: &str) -> bool {
    if STANDARD_VERBS.contains(&verb) {
        return true;
    }
    EXTRA_VERBS
        .iter()
        .any(|(r, extra)| *r == resource && extra.contains(&verb))
}

/// Expands one `(verb, resource)` pair of a policy rule against the
/// discovery descriptors. The rule's apiGroup does not constrain the match:
/// a resource name present in several groups expands into each, matching
/// how the audit table treats group/version as descriptive rather than
/// selective.
pub fn flatten(
    resources: &[ResourceDescriptor],
    verb: &str,
    resource: &str,
) -> Vec<ExpandedPermission> {
    let mut out = Vec::new();

    match (verb, resource) {
        ("*", "*") => {
            for rt in resources {
                for v in verbs_for_resource(&rt.resource) {
                    out.push(ExpandedPermission {
                        api_group: rt.api_group.clone(),
                        resource: rt.resource.clone(),
                        verb: v.to_string(),
                        namespaced: rt.namespaced,
                    });
                }
            }
        }
        ("*", concrete) => {
            for rt in resources.iter().filter(|rt| rt.resource == concrete) {
                for v in verbs_for_resource(&rt.resource) {
                    out.push(ExpandedPermission {
                        api_group: rt.api_group.clone(),
                        resource: rt.resource.clone(),
                        verb: v.to_string(),
                        namespaced: rt.namespaced,
                    });
                }
            }
        }
        (concrete_verb, "*") => {
            for rt in resources {
                if resource_admits_verb(&rt.resource, concrete_verb) {
                    out.push(ExpandedPermission {
                        api_group: rt.api_group.clone(),
                        resource: rt.resource.clone(),
                        verb: concrete_verb.to_string(),
                        namespaced: rt.namespaced,
                    });
                }
            }
        }
        (concrete_verb, concrete) => {
            // `parent/sub` rules are emitted verbatim against the parent's
            // descriptor; the subresource inherits the parent's scope flag.
            let (parent, subresource) = match concrete.split_once('/') {
                Some((p, s)) => (p, Some(s)),
                None => (concrete, None),
            };
            for rt in resources.iter().filter(|rt| rt.resource == parent) {
                let resource_name = match subresource {
                    Some(s) => format!("{}/{}", parent, s),
                    None => parent.to_string(),
                };
                out.push(ExpandedPermission {
                    api_group: rt.api_group.clone(),
                    resource: resource_name,
                    verb: concrete_verb.to_string(),
                    namespaced: rt.namespaced,
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors() -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor {
                api_group: "v1".into(),
                resource: "pods".into(),
                namespaced: true,
            },
            ResourceDescriptor {
                api_group: "v1".into(),
                resource: "nodes".into(),
                namespaced: false,
            },
            ResourceDescriptor {
                api_group: "rbac.authorization.k8s.io/v1".into(),
                resource: "roles".into(),
                namespaced: true,
            },
            ResourceDescriptor {
                api_group: "certificates.k8s.io/v1".into(),
                resource: "certificatesigningrequests".into(),
                namespaced: false,
            },
        ]
    }

    #[test]
    fn full_wildcard_is_the_verb_cross_product() {
        let resources = descriptors();
        let expanded = flatten(&resources, "*", "*");

        let expected: usize = resources
            .iter()
            .map(|rt| verbs_for_resource(&rt.resource).len())
            .sum();
        assert_eq!(expanded.len(), expected);

        // No duplicates in the cross product.
        let mut seen = std::collections::HashSet::new();
        for p in &expanded {
            assert!(seen.insert((p.api_group.clone(), p.resource.clone(), p.verb.clone())));
        }
    }

    #[test]
    fn wildcard_verb_expands_to_all_verbs_of_the_resource() {
        let expanded = flatten(&descriptors(), "*", "pods");
        assert_eq!(expanded.len(), STANDARD_VERBS.len());
        assert!(expanded.iter().all(|p| p.resource == "pods" && p.namespaced));

        let expanded = flatten(&descriptors(), "*", "roles");
        assert_eq!(expanded.len(), STANDARD_VERBS.len() + 2);
        assert!(expanded.iter().any(|p| p.verb == "bind"));
        assert!(expanded.iter().any(|p| p.verb == "escalate"));
    }

    #[test]
    fn wildcard_resource_respects_the_verb_whitelist() {
        // A standard verb matches every resource.
        let expanded = flatten(&descriptors(), "get", "*");
        assert_eq!(expanded.len(), 4);

        // A non-standard verb only matches its whitelisted resources.
        let expanded = flatten(&descriptors(), "approve", "*");
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].resource, "certificatesigningrequests");

        let expanded = flatten(&descriptors(), "impersonate", "*");
        assert!(expanded.is_empty());
    }

    #[test]
    fn concrete_rule_is_a_singleton_per_matching_descriptor() {
        let expanded = flatten(&descriptors(), "get", "nodes");
        assert_eq!(
            expanded,
            vec![ExpandedPermission {
                api_group: "v1".into(),
                resource: "nodes".into(),
                verb: "get".into(),
                namespaced: false,
            }]
        );
    }

    #[test]
    fn subresource_rules_are_emitted_verbatim() {
        let expanded = flatten(&descriptors(), "create", "pods/exec");
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].resource, "pods/exec");
        assert!(expanded[0].namespaced);
    }

    #[test]
    fn unknown_resources_expand_to_nothing() {
        assert!(flatten(&descriptors(), "get", "widgets").is_empty());
        assert!(flatten(&descriptors(), "*", "widgets").is_empty());
    }
}
