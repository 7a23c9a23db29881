//! Property tests for the dependency graph arena.

#[macro_use]
extern crate proptest;

use proptest::prelude::{any, prop, Strategy};
use rustc_hash::FxHashSet;
use tributary::controller::graph::{Graph, GraphError};

/// Random DAGs as edge sets over `n` nodes where every edge points from a
/// lower to a higher index; acyclic by construction.
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..50).prop_flat_map(|n| {
        let edges = prop::collection::vec((0..n, 0..n), 0..(n * 2)).prop_map(move |pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| if a < b { (a, b) } else { (b, a) })
                .collect::<Vec<_>>()
        });
        edges.prop_map(move |edges| (n, edges))
    })
}

fn node_name(i: usize) -> String {
    format!("node{i:02}")
}

fn graph_from(n: usize, edges: &[(usize, usize)]) -> Graph<String> {
    let mut graph = Graph::new();
    for i in 0..n {
        graph.insert(node_name(i)).unwrap();
    }
    // reader (higher index) depends on writer (lower index)
    let mut deps: Vec<Vec<String>> = vec![Vec::new(); n];
    for &(writer, reader) in edges {
        deps[reader].push(node_name(writer));
    }
    for (reader, writers) in deps.iter().enumerate() {
        graph.set_dependencies(&node_name(reader), writers);
    }
    graph
}

proptest! {
    /// Every writer sorts before every reader that references it, for any
    /// random DAG of up to 50 nodes.
    #[test]
    fn prop_topo_order_respects_every_edge((n, edges) in dag_strategy()) {
        let graph = graph_from(n, &edges);
        let order = graph.topo_order().unwrap();
        prop_assert_eq!(order.len(), n);

        let position = |name: &str| order.iter().position(|o| o == name).unwrap();
        for (writer, reader) in edges {
            prop_assert!(
                position(&node_name(writer)) < position(&node_name(reader)),
                "{} must evaluate before {}",
                node_name(writer),
                node_name(reader)
            );
        }
    }

    /// The order is deterministic: same graph, same order, every time.
    #[test]
    fn prop_topo_order_is_deterministic((n, edges) in dag_strategy()) {
        let graph = graph_from(n, &edges);
        prop_assert_eq!(graph.topo_order().unwrap(), graph.topo_order().unwrap());
    }

    /// Closing any path back on itself turns the sort into a cycle error
    /// naming the members.
    #[test]
    fn prop_back_edge_is_reported_as_cycle(
        (n, edges) in dag_strategy(),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(!edges.is_empty());
        let (writer, reader) = edges[pick.index(edges.len())];

        let mut graph = graph_from(n, &edges);
        // Make the writer also depend on the reader: a two-node loop
        // through any existing path.
        let mut writers: Vec<String> = graph
            .dependencies_of(&node_name(writer))
            .into_iter()
            .map(str::to_string)
            .collect();
        writers.push(node_name(reader));
        graph.set_dependencies(&node_name(writer), &writers);

        match graph.topo_order() {
            Err(GraphError::Cycle { members }) => {
                let members: FxHashSet<String> = members.into_iter().collect();
                prop_assert!(members.contains(&node_name(writer)));
                prop_assert!(members.contains(&node_name(reader)));
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other),
        }
    }

    /// Dependent closures never include the seeds and always include every
    /// transitive reader.
    #[test]
    fn prop_dependents_closure_is_transitive((n, edges) in dag_strategy()) {
        let graph = graph_from(n, &edges);
        let seeds: FxHashSet<String> = [node_name(0)].into_iter().collect();
        let closure = graph.dependents_closure(&seeds);
        prop_assert!(!closure.contains(&node_name(0)));

        // Fixed point: the closure of (seeds + closure) adds nothing new.
        let mut widened = seeds.clone();
        widened.extend(closure.iter().cloned());
        let again = graph.dependents_closure(&widened);
        for node in again {
            prop_assert!(closure.contains(&node));
        }
    }
}
