use std::collections::HashSet;

use super::error::ModuleError;

/// Dependency view of one bound provider.
#[derive(Debug, Clone, Copy)]
pub struct Dependency<'a> {
    pub module: &'a str,
    pub provider: &'a str,
    pub required: &'a [&'static str],
}

impl Dependency<'_> {
    fn label(&self) -> String {
        format!("{}/{}", self.module, self.provider)
    }
}

/// Computes a startup order in which every provider follows the providers of
/// all modules it requires. Returns indexes into `deps`.
///
/// Unknown module names fail before cycle detection. Independent providers keep
/// their relative input order.
pub fn sequence(deps: &[Dependency<'_>]) -> Result<Vec<usize>, ModuleError> {
    let known: HashSet<&str> = deps.iter().map(|d| d.module).collect();

    let missing: Vec<String> = deps
        .iter()
        .flat_map(|d| {
            d.required
                .iter()
                .filter(|m| !known.contains(**m))
                .map(move |m| format!("{} requires '{m}'", d.label()))
        })
        .collect();
    if !missing.is_empty() {
        return Err(ModuleError::ModuleNotFound { missing });
    }

    let mut started: HashSet<&str> = HashSet::with_capacity(deps.len());
    let mut order = Vec::with_capacity(deps.len());
    let mut pending: Vec<usize> = (0..deps.len()).collect();

    while !pending.is_empty() {
        let before = pending.len();

        pending.retain(|&idx| {
            let dep = &deps[idx];
            let ready = dep.required.iter().all(|m| started.contains(*m));
            if ready {
                started.insert(dep.module);
                order.push(idx);
            }
            !ready
        });

        if pending.len() == before {
            return Err(ModuleError::CycleDependency {
                providers: pending.iter().map(|&idx| deps[idx].label()).collect(),
            });
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep<'a>(module: &'a str, required: &'a [&'static str]) -> Dependency<'a> {
        Dependency {
            module,
            provider: "default",
            required,
        }
    }

    fn modules<'a>(deps: &[Dependency<'a>], order: &[usize]) -> Vec<&'a str> {
        order.iter().map(|&i| deps[i].module).collect()
    }

    #[test]
    fn test_sequence_respects_dependencies() {
        let deps = [dep("c", &["a", "b"]), dep("a", &[]), dep("b", &["a"])];
        let order = sequence(&deps).expect("acyclic");
        assert_eq!(modules(&deps, &order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sequence_is_deterministic() {
        let deps = [
            dep("storage", &[]),
            dep("telemetry", &[]),
            dep("core", &["storage", "telemetry"]),
            dep("cluster", &["telemetry"]),
        ];
        let first = sequence(&deps).expect("acyclic");
        for _ in 0..10 {
            assert_eq!(sequence(&deps).expect("acyclic"), first);
        }
        assert_eq!(
            modules(&deps, &first),
            vec!["storage", "telemetry", "core", "cluster"]
        );
    }

    #[test]
    fn test_every_provider_follows_its_requirements() {
        let deps = [
            dep("e", &["d"]),
            dep("d", &["b", "c"]),
            dep("c", &["a"]),
            dep("b", &["a"]),
            dep("a", &[]),
        ];
        let order = sequence(&deps).expect("acyclic");
        let position = |m: &str| {
            order
                .iter()
                .position(|&i| deps[i].module == m)
                .expect("sequenced")
        };
        for d in &deps {
            for req in d.required {
                assert!(position(*req) < position(d.module), "{req} before {}", d.module);
            }
        }
    }

    #[test]
    fn test_cycle_names_all_stuck_providers() {
        let deps = [dep("a", &["b"]), dep("b", &["a"])];
        let err = sequence(&deps).expect_err("cycle");
        assert_eq!(
            err,
            ModuleError::CycleDependency {
                providers: vec!["a/default".to_string(), "b/default".to_string()],
            }
        );
    }

    #[test]
    fn test_cycle_excludes_resolvable_providers() {
        let deps = [dep("root", &[]), dep("x", &["y", "root"]), dep("y", &["x"])];
        match sequence(&deps) {
            Err(ModuleError::CycleDependency { providers }) => {
                assert_eq!(providers, vec!["x/default", "y/default"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_module_fails_before_cycle_detection() {
        // a <-> b is a cycle, but the unknown module must be reported first.
        let deps = [dep("a", &["b", "ghost"]), dep("b", &["a"])];
        let err = sequence(&deps).expect_err("missing module");
        assert_eq!(
            err,
            ModuleError::ModuleNotFound {
                missing: vec!["a/default requires 'ghost'".to_string()],
            }
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(sequence(&[]).expect("empty").is_empty());
    }
}
