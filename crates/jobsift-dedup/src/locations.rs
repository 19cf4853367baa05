//! Location metadata merge for a canonical posting and its duplicates.

use std::collections::BTreeSet;

use jobsift_core::JobRecord;

fn collect_into<'a>(set: &mut BTreeSet<String>, values: impl IntoIterator<Item = &'a String>) {
    for value in values {
        let value = value.trim();
        if !value.is_empty() {
            set.insert(value.to_string());
        }
    }
}

/// Union of locations and of cities across the canonical and its duplicates.
///
/// Locations take each record's `location` plus its `locations_derived`; cities take
/// `cities_derived` only. Blank values are dropped and both lists come back sorted
/// and unique. Nothing else about the postings is merged.
pub fn merge_locations(
    canonical: &JobRecord,
    duplicates: &[&JobRecord],
) -> (Vec<String>, Vec<String>) {
    let mut locations = BTreeSet::new();
    let mut cities = BTreeSet::new();

    for job in std::iter::once(canonical).chain(duplicates.iter().copied()) {
        collect_into(&mut locations, job.location.iter());
        collect_into(&mut locations, job.locations_derived.iter());
        collect_into(&mut cities, job.cities_derived.iter());
    }

    (locations.into_iter().collect(), cities.into_iter().collect())
}

/// Merged locations the canonical's `locations_derived` did not carry yet.
pub fn new_location_count(canonical: &JobRecord, merged_locations: &[String]) -> usize {
    let mut existing = BTreeSet::new();
    collect_into(&mut existing, canonical.locations_derived.iter());
    merged_locations
        .iter()
        .filter(|location| !existing.contains(location.as_str()))
        .count()
}
