//! Size-balanced bin packing for the Picker.
//!
//! The bin count comes from the target bundle size S and the total payload
//! T: `n_bins = max(1, max(ceil(T / (S * 1.2)), round(T / S)))`. Files are
//! then distributed worst-fit-decreasing: largest first, each into the
//! currently least-loaded bin that stays under the 1.2*S cap. The cap is the
//! only hard constraint; a bin is opened beyond `n_bins` when nothing else
//! fits, and a single file larger than the cap sits in a bin of its own.
//!
//! The pass is deterministic: input order does not matter because files are
//! sorted by size descending with the uuid as tiebreak.

use lta_api::models::CatalogFileStub;

/// Upper bound on a bin, as a multiple of the ideal bundle size.
const BIN_CAP_FACTOR: f64 = 1.2;

/// Number of bins for a payload of `total_size` and target bundle size
/// `ideal_size`.
pub fn bin_count(total_size: u64, ideal_size: u64) -> usize {
    debug_assert!(ideal_size > 0);
    let total = total_size as f64;
    let ideal = ideal_size as f64;
    let by_cap = (total / (ideal * BIN_CAP_FACTOR)).ceil() as usize;
    let by_ideal = (total / ideal).round() as usize;
    by_cap.max(by_ideal).max(1)
}

/// Distribute `files` into size-balanced bins. Every file lands in exactly
/// one bin and every returned bin is non-empty.
pub fn pack(mut files: Vec<CatalogFileStub>, ideal_size: u64) -> Vec<Vec<CatalogFileStub>> {
    let total_size: u64 = files.iter().map(|f| f.file_size).sum();
    let n_bins = bin_count(total_size, ideal_size);
    let cap = (ideal_size as f64 * BIN_CAP_FACTOR) as u64;

    files.sort_by(|a, b| {
        b.file_size
            .cmp(&a.file_size)
            .then_with(|| a.uuid.cmp(&b.uuid))
    });

    let mut bins: Vec<(u64, Vec<CatalogFileStub>)> = (0..n_bins).map(|_| (0, Vec::new())).collect();
    for file in files {
        // Least-loaded bin the file fits into, lowest index on ties.
        let mut target: Option<(usize, u64)> = None;
        for (index, (size, items)) in bins.iter().enumerate() {
            if !items.is_empty() && size + file.file_size > cap {
                continue;
            }
            if target.map_or(true, |(_, best)| *size < best) {
                target = Some((index, *size));
            }
        }
        match target {
            Some((index, _)) => {
                bins[index].0 += file.file_size;
                bins[index].1.push(file);
            }
            None => {
                // Nothing fits under the cap; the file opens its own bin.
                bins.push((file.file_size, vec![file]));
            }
        }
    }

    bins.retain(|(_, items)| !items.is_empty());
    bins.into_iter().map(|(_, items)| items).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn stub(uuid: &str, file_size: u64) -> CatalogFileStub {
        CatalogFileStub {
            uuid: uuid.to_string(),
            file_size,
        }
    }

    fn stubs(sizes: &[u64]) -> Vec<CatalogFileStub> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| stub(&format!("file-{i:06}"), *size))
            .collect()
    }

    #[test]
    fn payload_under_the_cap_makes_a_single_bundle() {
        // Scenario: three PFDST files against a 1 TB target.
        let files = stubs(&[103_166_718, 103_064_762, 104_136_149]);
        let bins = pack(files, 1_000_000_000_000);
        assert_eq!(bins.len(), 1);
        assert_eq!(bins[0].len(), 3);
    }

    #[test]
    fn bin_count_boundaries() {
        let s = 10 * GIB;
        // T <= 1.2*S stays a single bin.
        assert_eq!(bin_count(12 * GIB, s), 1);
        // Just over the cap: round(1.20001) = 1 but ceil-by-cap = 2.
        assert_eq!(bin_count(12 * GIB + 1, s), 2);
        // round() takes over when the payload is close to a multiple of S.
        assert_eq!(bin_count(89 * GIB, s), 9);
        assert_eq!(bin_count(91 * GIB, s), 9);
        // 2.4*S sits exactly on the cap boundary.
        assert_eq!(bin_count(24 * GIB, s), 2);
        // Degenerate payloads still get one bin.
        assert_eq!(bin_count(0, s), 1);
    }

    #[test]
    fn every_file_lands_in_exactly_one_bin() {
        let files = stubs(&[7, 3, 9, 1, 5, 2, 8, 4, 6, 10]);
        let bins = pack(files.clone(), 10);
        let mut seen: Vec<String> = bins
            .iter()
            .flat_map(|bin| bin.iter().map(|f| f.uuid.clone()))
            .collect();
        seen.sort();
        let mut expected: Vec<String> = files.into_iter().map(|f| f.uuid).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(bins.iter().all(|bin| !bin.is_empty()));
    }

    #[test]
    fn no_bin_exceeds_the_cap_for_divisible_payloads() {
        // 900 files of ~101 MiB plus two stragglers against a 10 GiB target.
        let mut sizes = vec![101 * (1 << 20); 900];
        sizes.push(1024);
        sizes.push(2048);
        let files = stubs(&sizes);
        let total: u64 = files.iter().map(|f| f.file_size).sum();
        let expected_bins = bin_count(total, 10 * GIB);
        let bins = pack(files, 10 * GIB);
        assert_eq!(bins.len(), expected_bins);
        let cap = 12 * GIB;
        for bin in &bins {
            let size: u64 = bin.iter().map(|f| f.file_size).sum();
            assert!(size <= cap, "bin of {size} bytes exceeds the {cap} cap");
        }
    }

    #[test]
    fn an_oversized_file_gets_a_bin_of_its_own() {
        let files = stubs(&[30 * GIB, GIB, GIB]);
        let bins = pack(files, 10 * GIB);
        let oversized: Vec<_> = bins
            .iter()
            .filter(|bin| bin.iter().any(|f| f.file_size == 30 * GIB))
            .collect();
        assert_eq!(oversized.len(), 1);
        assert_eq!(oversized[0].len(), 1);
    }

    #[test]
    fn packing_is_deterministic_regardless_of_input_order() {
        let forward = stubs(&[5, 9, 1, 7, 3, 8, 2, 6, 4, 10]);
        let mut reversed = forward.clone();
        reversed.reverse();
        let a = pack(forward, 12);
        let b = pack(reversed, 12);
        assert_eq!(
            a.iter()
                .map(|bin| bin.iter().map(|f| f.uuid.clone()).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            b.iter()
                .map(|bin| bin.iter().map(|f| f.uuid.clone()).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        );
    }
}
