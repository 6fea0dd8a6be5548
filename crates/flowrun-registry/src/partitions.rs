use std::collections::BTreeSet;

use flowrun_model::WorkerInstance;

/// Strip, from the other instances of `updated`'s worker group, the
/// partitions `updated` now owns.
///
/// `all` is visited in registration order. Only the instances that lost a
/// partition are returned, with their new partition set.
pub fn remove_evicted_partitions(
  all: &[WorkerInstance],
  updated: &WorkerInstance,
) -> Vec<WorkerInstance> {
  all
    .iter()
    .filter(|other| other.worker_uuid != updated.worker_uuid)
    .filter(|other| other.worker_group == updated.worker_group)
    .filter(|other| !other.partitions.is_disjoint(&updated.partitions))
    .map(|other| {
      let mut changed = other.clone();
      changed.partitions = other
        .partitions
        .difference(&updated.partitions)
        .copied()
        .collect();
      changed
    })
    .collect()
}

/// Partitions a newly registered instance should own.
///
/// Unowned partitions all go to the newcomer. When every partition is owned,
/// it gets a balanced share taken from the most loaded instances, never
/// leaving one of them empty. `others` are the live instances of the same
/// worker group, in registration order.
pub fn assign_partitions(others: &[WorkerInstance], partitions: i32) -> BTreeSet<i32> {
  let owned: BTreeSet<i32> = others
    .iter()
    .flat_map(|other| other.partitions.iter().copied())
    .collect();
  let unowned: BTreeSet<i32> = (0..partitions).filter(|p| !owned.contains(p)).collect();
  if !unowned.is_empty() {
    return unowned;
  }

  let share = partitions as usize / (others.len() + 1);
  let mut remaining: Vec<BTreeSet<i32>> = others.iter().map(|o| o.partitions.clone()).collect();
  let mut taken = BTreeSet::new();

  while taken.len() < share {
    // first of the most loaded, registration order breaking ties
    let mut donor: Option<usize> = None;
    for (index, owned) in remaining.iter().enumerate() {
      if donor.is_none_or(|d| owned.len() > remaining[d].len()) {
        donor = Some(index);
      }
    }

    let Some(donor) = donor else {
      break;
    };
    if remaining[donor].len() <= taken.len() + 1 {
      break;
    }
    let Some(partition) = remaining[donor].pop_last() else {
      break;
    };
    taken.insert(partition);
  }

  taken
}

/// Hand `partitions` over to `instances`, each to the instance owning the
/// fewest at that point (registration order on ties).
///
/// Returns the instances that received something.
pub fn redistribute_partitions(
  instances: &[WorkerInstance],
  partitions: &BTreeSet<i32>,
) -> Vec<WorkerInstance> {
  if instances.is_empty() {
    return Vec::new();
  }

  let mut updated: Vec<WorkerInstance> = instances.to_vec();
  let mut changed = vec![false; updated.len()];

  for partition in partitions {
    let Some(index) = updated
      .iter()
      .enumerate()
      .min_by_key(|(_, instance)| instance.partitions.len())
      .map(|(index, _)| index)
    else {
      break;
    };
    updated[index].partitions.insert(*partition);
    changed[index] = true;
  }

  updated
    .into_iter()
    .zip(changed)
    .filter(|(_, changed)| *changed)
    .map(|(instance, _)| instance)
    .collect()
}
