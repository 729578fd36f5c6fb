//! Executability over the module dependency graph.
//!
//! A module is executable when nothing its code can reach is missing: its
//! own reference set is fully resolved and, transitively, so is every
//! module it binds into. The walk runs over a snapshot of the graph, resets
//! every verdict, and memoizes; a module encountered while its own verdict
//! is still being computed (a cycle) is taken as executable, so mutually
//! recursive modules do not deadlock each other into `No`.

use crate::{
    module::{Executability, Module, ModuleId},
    os::Mmap,
};
use hashbrown::HashMap;

struct NodeInfo {
    resolved: bool,
    uses: Vec<ModuleId>,
}

/// Recomputes the tri-state for every module. Returns the modules whose
/// verdict changed, with old and new values, for hook dispatch.
pub(crate) fn recompute<M: Mmap>(
    modules: &mut HashMap<ModuleId, Module<M>>,
    shallow: bool,
) -> Vec<(ModuleId, Executability, Executability)> {
    let graph: HashMap<ModuleId, NodeInfo> = modules
        .iter()
        .map(|(&id, m)| {
            (
                id,
                NodeInfo {
                    // Containers hold no code of their own.
                    resolved: m.is_archive || m.unresolved.is_empty(),
                    uses: m.uses.iter().copied().collect(),
                },
            )
        })
        .collect();

    let mut memo: HashMap<ModuleId, Executability> = HashMap::new();
    for &id in graph.keys() {
        visit(id, &graph, &mut memo, shallow);
    }

    let mut changes = Vec::new();
    for (id, module) in modules.iter_mut() {
        let new = memo.get(id).copied().unwrap_or(Executability::No);
        let old = module.executable;
        if old != new {
            module.executable = new;
            changes.push((*id, old, new));
        }
    }
    changes.sort_unstable_by_key(|(id, _, _)| *id);
    changes
}

fn visit(
    id: ModuleId,
    graph: &HashMap<ModuleId, NodeInfo>,
    memo: &mut HashMap<ModuleId, Executability>,
    shallow: bool,
) -> Executability {
    if let Some(&state) = memo.get(&id) {
        return state;
    }
    let Some(info) = graph.get(&id) else {
        // Edge to a module removed in this round; its definitions are gone
        // too, so the dependent's own unresolved set already reflects it.
        return Executability::Yes;
    };
    // Tentative verdict read by cycle participants.
    memo.insert(id, Executability::Yes);
    let mut state = if info.resolved {
        Executability::Yes
    } else {
        Executability::No
    };
    if state == Executability::Yes && !shallow {
        for &dep in &info.uses {
            if visit(dep, graph, memo, shallow) == Executability::No {
                state = Executability::No;
                break;
            }
        }
    }
    memo.insert(id, state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::DefaultMmap;

    fn graph(
        nodes: &[(u64, bool, &[u64])],
    ) -> HashMap<ModuleId, Module<DefaultMmap>> {
        let mut map = HashMap::new();
        for &(id, resolved, uses) in nodes {
            let mut m = Module::new_for_tests(ModuleId::from_raw(id));
            if !resolved {
                m.unresolved.insert("missing".to_owned());
            }
            for &u in uses {
                m.uses.insert(ModuleId::from_raw(u));
            }
            map.insert(ModuleId::from_raw(id), m);
        }
        map
    }

    fn state(map: &HashMap<ModuleId, Module<DefaultMmap>>, id: u64) -> Executability {
        map[&ModuleId::from_raw(id)].executable
    }

    #[test]
    fn unresolved_dependency_poisons_users() {
        let mut map = graph(&[(1, true, &[2]), (2, false, &[])]);
        recompute(&mut map, false);
        assert_eq!(state(&map, 1), Executability::No);
        assert_eq!(state(&map, 2), Executability::No);
    }

    #[test]
    fn cycles_are_executable() {
        let mut map = graph(&[(1, true, &[2]), (2, true, &[1])]);
        recompute(&mut map, false);
        assert_eq!(state(&map, 1), Executability::Yes);
        assert_eq!(state(&map, 2), Executability::Yes);
    }

    #[test]
    fn shallow_mode_skips_the_walk() {
        let mut map = graph(&[(1, true, &[2]), (2, false, &[])]);
        recompute(&mut map, true);
        assert_eq!(state(&map, 1), Executability::Yes);
        assert_eq!(state(&map, 2), Executability::No);
    }

    #[test]
    fn recompute_reports_changes_once() {
        let mut map = graph(&[(1, true, &[])]);
        let changes = recompute(&mut map, false);
        assert_eq!(
            changes,
            vec![(
                ModuleId::from_raw(1),
                Executability::Unknown,
                Executability::Yes
            )]
        );
        assert!(recompute(&mut map, false).is_empty());
    }
}
