//! Topological ordering
//!
//! Two flavours of Kahn's algorithm live here. [`compute_retrieve_order`] orders descriptors by
//! their retrieve dependencies and treats any problem as a fatal configuration error.
//! [`order_working_set`] orders the keys of one transaction: it never fails, instead it reports
//! every dependency cycle it finds so that only the offending keys are rejected.
//!
//! Ties are always broken by input order, which keeps execution traces deterministic.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::{error::Error, value::Key};

/// Compute the order in which descriptors must be retrieved.
///
/// # Arguments
/// - `descriptors`: Iterator of (descriptor_name, retrieve_dependencies) tuples, in registration
///   order
///
/// # Returns
/// Ordered list of descriptor names where dependencies always come before dependents
pub(crate) fn compute_retrieve_order<'a>(
	descriptors: impl Iterator<Item = (&'a str, &'a [String])>,
) -> Result<Vec<String>, Error> {
	let descriptors = descriptors.collect::<Vec<_>>();
	let index = descriptors
		.iter()
		.enumerate()
		.map(|(i, (name, _))| (*name, i))
		.collect::<HashMap<_, _>>();

	let mut dependents = vec![Vec::new(); descriptors.len()];
	let mut in_degree = vec![0_usize; descriptors.len()];

	for (i, (name, deps)) in descriptors.iter().enumerate() {
		for dep in *deps {
			let Some(&dep_idx) = index.get(dep.as_str()) else {
				return Err(Error::UnknownRetrieveDependency(
					(*name).to_string(),
					dep.clone(),
				));
			};

			// Add edge: dep -> descriptor (dep must be retrieved first)
			dependents[dep_idx].push(i);
			in_degree[i] += 1;
		}
	}

	let mut queue = in_degree
		.iter()
		.enumerate()
		.filter(|(_, &degree)| degree == 0)
		.map(|(i, _)| i)
		.collect::<BTreeSet<_>>();

	let mut result = Vec::with_capacity(descriptors.len());

	while let Some(i) = queue.pop_first() {
		result.push(descriptors[i].0.to_string());

		for &dependent in &dependents[i] {
			in_degree[dependent] -= 1;
			if in_degree[dependent] == 0 {
				queue.insert(dependent);
			}
		}
	}

	if result.len() != descriptors.len() {
		let sorted = result.iter().map(String::as_str).collect::<HashSet<_>>();
		let unsorted = descriptors
			.iter()
			.map(|(name, _)| *name)
			.filter(|name| !sorted.contains(name))
			.collect::<Vec<_>>();

		return Err(Error::CircularRetrieveDependency(unsorted.join(", ")));
	}

	Ok(result)
}

/// Result of ordering one working set.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct WorkingSetOrder {
	/// Every input key exactly once. Keys involved in, or stuck behind, a cycle come last.
	pub(crate) order: Vec<Key>,
	/// Strongly connected components with more than one member, or a key depending on itself.
	pub(crate) cycles: Vec<Vec<Key>>,
}

/// Orders `keys` so that for every edge returned by `before(key)` the referenced key comes
/// first. References to keys outside of the input are ignored.
pub(crate) fn order_working_set<F>(keys: &[Key], before: F) -> WorkingSetOrder
where
	F: Fn(&Key) -> Vec<Key>,
{
	let index = keys
		.iter()
		.enumerate()
		.map(|(i, key)| (key.as_str(), i))
		.collect::<HashMap<_, _>>();

	let mut edges = vec![Vec::new(); keys.len()];
	let mut dependents = vec![Vec::new(); keys.len()];
	let mut in_degree = vec![0_usize; keys.len()];

	for (i, key) in keys.iter().enumerate() {
		let mut seen = HashSet::new();
		for other in before(key) {
			if let Some(&j) = index.get(other.as_str()) {
				if seen.insert(j) {
					edges[i].push(j);
					dependents[j].push(i);
					in_degree[i] += 1;
				}
			}
		}
	}

	let mut queue = in_degree
		.iter()
		.enumerate()
		.filter(|(_, &degree)| degree == 0)
		.map(|(i, _)| i)
		.collect::<BTreeSet<_>>();

	let mut sorted = Vec::with_capacity(keys.len());
	let mut done = vec![false; keys.len()];

	while let Some(i) = queue.pop_first() {
		sorted.push(i);
		done[i] = true;

		for &dependent in &dependents[i] {
			in_degree[dependent] -= 1;
			if in_degree[dependent] == 0 {
				queue.insert(dependent);
			}
		}
	}

	let mut cycles = Vec::new();

	if sorted.len() != keys.len() {
		for mut component in strongly_connected(&edges, &done) {
			if component.len() > 1 || edges[component[0]].contains(&component[0]) {
				component.sort_unstable();
				cycles.push(component);
			}
		}
		cycles.sort_unstable_by_key(|component| component[0]);

		// Leftovers (cycle members and whatever waits on them) keep their input order.
		sorted.extend((0..keys.len()).filter(|&i| !done[i]));
	}

	WorkingSetOrder {
		order: sorted.into_iter().map(|i| keys[i].clone()).collect(),
		cycles: cycles
			.into_iter()
			.map(|component| component.into_iter().map(|i| keys[i].clone()).collect())
			.collect(),
	}
}

/// Tarjan's algorithm restricted to the nodes not marked as `excluded`, iterative so that deep
/// chains can't overflow the stack.
fn strongly_connected(edges: &[Vec<usize>], excluded: &[bool]) -> Vec<Vec<usize>> {
	const UNVISITED: usize = usize::MAX;

	let n = edges.len();
	let mut indexes = vec![UNVISITED; n];
	let mut low_links = vec![0; n];
	let mut on_stack = vec![false; n];
	let mut stack = Vec::new();
	let mut components = Vec::new();
	let mut next_index = 0;

	for root in 0..n {
		if excluded[root] || indexes[root] != UNVISITED {
			continue;
		}

		// (node, position of the next edge to explore)
		let mut call_stack = vec![(root, 0)];
		indexes[root] = next_index;
		low_links[root] = next_index;
		next_index += 1;
		stack.push(root);
		on_stack[root] = true;

		while let Some(&(node, edge_pos)) = call_stack.last() {
			if let Some(&next) = edges[node].get(edge_pos) {
				if let Some(top) = call_stack.last_mut() {
					top.1 += 1;
				}

				if excluded[next] {
					continue;
				}

				if indexes[next] == UNVISITED {
					indexes[next] = next_index;
					low_links[next] = next_index;
					next_index += 1;
					stack.push(next);
					on_stack[next] = true;
					call_stack.push((next, 0));
				} else if on_stack[next] {
					low_links[node] = low_links[node].min(indexes[next]);
				}
			} else {
				call_stack.pop();

				if let Some(&(parent, _)) = call_stack.last() {
					low_links[parent] = low_links[parent].min(low_links[node]);
				}

				if low_links[node] == indexes[node] {
					let mut component = Vec::new();
					while let Some(member) = stack.pop() {
						on_stack[member] = false;
						component.push(member);
						if member == node {
							break;
						}
					}
					components.push(component);
				}
			}
		}
	}

	components
}
