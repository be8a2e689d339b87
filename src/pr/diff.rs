use super::types::DiffRange;
use super::PrError;

/// Build the addressable ranges of a single file's unified-diff patch.
///
/// The patch is the per-file text GitHub returns in the `patch` field of the
/// pull files listing: one or more hunks, each introduced by
///   @@ -{old_start},{old_count} +{new_start},{new_count} @@
///
/// Deletions are recorded against the running new-file line counter before
/// it advances; context and added lines advance it by one. A patch with no
/// hunks (binary files, oversized diffs) yields no ranges.
pub fn build_ranges(patch: &str) -> Result<Vec<DiffRange>, PrError> {
    let mut ranges = Vec::new();
    let mut current: Option<(u64, u64)> = None;
    let mut deletions = Vec::new();
    let mut offset = 0;
    let mut line_number = 0;

    for line in patch.lines() {
        if line.starts_with("@@") {
            let (new_start, new_count) = parse_hunk_header(line)?;
            if let Some((start, length)) = current.take() {
                let range = close_range(start, length, offset, std::mem::take(&mut deletions))?;
                offset = offset.checked_add(range.length).ok_or_else(overflow)?;
                ranges.push(range);
            }
            current = Some((new_start, new_count));
            line_number = new_start;
            continue;
        }

        if current.is_none() || line.starts_with('\\') {
            continue;
        }

        if line.starts_with('-') {
            deletions.push(line_number);
        } else {
            line_number = line_number.checked_add(1).ok_or_else(overflow)?;
        }
    }

    if let Some((start, length)) = current {
        ranges.push(close_range(start, length, offset, deletions)?);
    }

    Ok(ranges)
}

fn close_range(
    start: u64,
    length: u64,
    offset: u64,
    deletions: Vec<u64>,
) -> Result<DiffRange, PrError> {
    // One extra line for the @@ header itself.
    let rendered = (deletions.len() as u64)
        .checked_add(length)
        .and_then(|n| n.checked_add(1))
        .ok_or_else(overflow)?;
    Ok(DiffRange {
        start,
        end: start.checked_add(length).ok_or_else(overflow)?,
        length: rendered,
        offset,
        deletions,
    })
}

fn overflow() -> PrError {
    PrError::DiffParse("Hunk range overflows".to_string())
}

/// Translate an absolute new-file line into its position in the rendered diff.
///
/// Returns `None` when no hunk covers the line; such lines must never be
/// commented on.
pub fn translate(ranges: &[DiffRange], line: u64) -> Option<u64> {
    let range = ranges
        .iter()
        .find(|range| line >= range.start && line < range.end)?;
    let shifted = range.deletions.iter().filter(|&&d| d <= line).count() as u64;
    range
        .offset
        .checked_add(line - range.start)?
        .checked_add(1 + shifted)
}

fn parse_hunk_header(line: &str) -> Result<(u64, u64), PrError> {
    let header = line
        .trim()
        .strip_prefix("@@")
        .ok_or_else(|| PrError::DiffParse("Invalid hunk header".to_string()))?;
    let header = header
        .split("@@")
        .next()
        .ok_or_else(|| PrError::DiffParse("Invalid hunk header".to_string()))?
        .trim();
    let mut parts = header.split_whitespace();
    let old_part = parts
        .next()
        .ok_or_else(|| PrError::DiffParse("Missing old range".to_string()))?;
    let new_part = parts
        .next()
        .ok_or_else(|| PrError::DiffParse("Missing new range".to_string()))?;

    parse_range(old_part, '-')?;
    parse_range(new_part, '+')
}

fn parse_range(part: &str, prefix: char) -> Result<(u64, u64), PrError> {
    let range = part
        .strip_prefix(prefix)
        .ok_or_else(|| PrError::DiffParse("Invalid range prefix".to_string()))?;
    let (start_str, count_str) = match range.split_once(',') {
        Some((start, count)) => (start, count),
        None => (range, "1"),
    };
    let start = start_str
        .parse::<u64>()
        .map_err(|_| PrError::DiffParse(format!("Invalid range start in {}", part)))?;
    let count = count_str
        .parse::<u64>()
        .map_err(|_| PrError::DiffParse(format!("Invalid range count in {}", part)))?;
    start.checked_add(count).ok_or_else(overflow)?;
    Ok((start, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_HUNK: &str = "@@ -1,3 +1,4 @@\n context\n-old\n+new1\n+new2\n context";

    const TWO_HUNKS: &str = "@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n@@ -10,2 +10,3 @@\n x\n+y\n z";

    #[test]
    fn test_single_hunk_range() {
        let ranges = build_ranges(SINGLE_HUNK).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 1);
        assert_eq!(ranges[0].end, 5);
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[0].deletions, vec![2]);
        assert_eq!(ranges[0].length, 6);
    }

    #[test]
    fn test_deletion_shifts_following_positions() {
        let ranges = build_ranges(SINGLE_HUNK).unwrap();
        assert_eq!(translate(&ranges, 1), Some(1));
        assert_eq!(translate(&ranges, 2), Some(3));
        assert_eq!(translate(&ranges, 3), Some(4));
        assert_eq!(translate(&ranges, 4), Some(5));
    }

    #[test]
    fn test_lines_outside_hunks_are_not_found() {
        let ranges = build_ranges(TWO_HUNKS).unwrap();
        for line in [0, 4, 5, 9, 13, 100] {
            assert_eq!(translate(&ranges, line), None, "line {line}");
        }
    }

    #[test]
    fn test_positions_strictly_increase_within_hunk() {
        let ranges = build_ranges(TWO_HUNKS).unwrap();
        for range in &ranges {
            let positions: Vec<u64> = (range.start..range.end)
                .map(|line| translate(&ranges, line).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
        }
    }

    #[test]
    fn test_second_hunk_offset_counts_header_and_deletions() {
        let ranges = build_ranges(TWO_HUNKS).unwrap();
        assert_eq!(ranges.len(), 2);
        // first hunk: header + 3 declared lines + 1 deletion
        assert_eq!(ranges[1].offset, 5);
        // the second @@ header sits at position 5, its first line at 6
        assert_eq!(translate(&ranges, 10), Some(6));
        assert_eq!(translate(&ranges, 11), Some(7));
    }

    #[test]
    fn test_patch_without_hunks_is_empty() {
        assert!(build_ranges("").unwrap().is_empty());
        assert!(build_ranges("Binary files differ").unwrap().is_empty());
    }

    #[test]
    fn test_header_without_count_defaults_to_one() {
        let ranges = build_ranges("@@ -3 +3 @@\n-x\n+y").unwrap();
        assert_eq!(ranges[0].start, 3);
        assert_eq!(ranges[0].end, 4);
        assert_eq!(translate(&ranges, 3), Some(2));
    }

    #[test]
    fn test_no_newline_marker_is_ignored() {
        let patch = "@@ -1,1 +1,2 @@\n-a\n\\ No newline at end of file\n+a\n+b";
        let ranges = build_ranges(patch).unwrap();
        assert_eq!(ranges[0].deletions, vec![1]);
        assert_eq!(translate(&ranges, 2), Some(3));
    }

    #[test]
    fn test_header_with_section_heading() {
        let ranges = build_ranges("@@ -5,2 +5,2 @@ fn main() {\n a\n b").unwrap();
        assert_eq!(ranges[0].start, 5);
    }

    #[test]
    fn test_malformed_header_is_an_error() {
        assert!(build_ranges("@@ garbage @@\n+x").is_err());
        assert!(build_ranges("@@ -1,x +1,2 @@\n+x").is_err());
    }

    #[test]
    fn test_range_end_is_exclusive() {
        let ranges = build_ranges("@@ -1,1 +1,2 @@\n-a\n+a\n+b").unwrap();
        assert_eq!(ranges[0].end, 3);
        assert_eq!(translate(&ranges, 2), Some(3));
        assert_eq!(translate(&ranges, ranges[0].end), None);
    }

    #[test]
    fn test_overflowing_header_is_an_error() {
        assert!(build_ranges("@@ -1,1 +18446744073709551615,5 @@\n+x").is_err());
        assert!(build_ranges("@@ -1,1 +18446744073709551615,0 @@\n x").is_err());
        assert!(build_ranges("@@ -1,1 +1,18446744073709551615 @@\n+x").is_err());
    }
}
