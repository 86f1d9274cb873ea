//! Dependency graph checks over a step map.
//!
//! Kahn's algorithm decides acyclicity and produces an execution order; a
//! DFS colouring pass recovers the members of a cycle for error messages.
//! Dependencies naming steps outside the map are ignored here; `Plan::new`
//! rejects them separately.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::model::{Plan, PlanStep};

/// True if the plan's dependency graph contains a cycle.
pub fn detect_cycle(plan: &Plan) -> bool {
    topological_order(&plan.steps).is_none()
}

/// Step ids ordered so every step comes after its dependencies, or `None`
/// if there is a cycle.
pub fn topological_order(steps: &BTreeMap<String, PlanStep>) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps.values() {
        let known = step
            .dependencies
            .iter()
            .filter(|d| steps.contains_key(*d))
            .inspect(|d| dependents.entry(d.as_str()).or_default().push(step.id.as_str()))
            .count();
        in_degree.insert(step.id.as_str(), known);
    }

    let mut queue: VecDeque<&str> = steps
        .keys()
        .map(String::as_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    (order.len() == steps.len()).then_some(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// The members of one cycle, first member repeated at the end
/// (`A -> B -> A`), or `None` if the graph is acyclic.
pub fn find_cycle(steps: &BTreeMap<String, PlanStep>) -> Option<Vec<String>> {
    let mut colour: HashMap<&str, Colour> = steps.keys().map(|k| (k.as_str(), Colour::White)).collect();
    let mut path = Vec::new();

    for id in steps.keys() {
        if colour.get(id.as_str()) == Some(&Colour::White)
            && let Some(cycle) = visit(id, steps, &mut colour, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    steps: &'a BTreeMap<String, PlanStep>,
    colour: &mut HashMap<&'a str, Colour>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colour.insert(id, Colour::Grey);
    path.push(id);

    if let Some(step) = steps.get(id) {
        for dep in &step.dependencies {
            match colour.get(dep.as_str()) {
                Some(Colour::Grey) => {
                    let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Colour::White) => {
                    if let Some(cycle) = visit(dep, steps, colour, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
    }

    path.pop();
    colour.insert(id, Colour::Black);
    None
}
