//! Streaming top-k label selection over a per-frame probability matrix.

use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::catalog::LabelCatalog;
use crate::infer::ProbabilityMatrix;

/// Labels tracked across the clip, in final selection order: the last frame's
/// argmax first, then the most persistent per-frame candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSelection {
    pub indices: Vec<usize>,
    /// One confidence curve per tracked label: `[tracked, F]`.
    pub curves: Array2<f32>,
    pub labels: Vec<String>,
}

impl StreamingSelection {
    pub fn tracked_count(&self) -> usize {
        self.indices.len()
    }

    pub fn frame_count(&self) -> usize {
        self.curves.ncols()
    }
}

/// Indices of the `k` largest values, highest first. Ties keep the lower
/// index first, matching a stable descending sort.
pub fn top_k_indices(row: ArrayView1<'_, f32>, k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal));
    order.truncate(k);
    order
}

/// Top-k labels with probabilities for a single distribution, best first.
pub fn top_k_labels(
    row: &Array1<f32>,
    k: usize,
    catalog: &LabelCatalog,
) -> Result<Vec<(String, f32)>> {
    top_k_indices(row.view(), k)
        .into_iter()
        .map(|index| Ok((catalog.label(index)?.to_string(), row[index])))
        .collect()
}

/// Chooses which labels to track across the whole clip:
///
/// 1. `last_top1` = argmax of the final frame's distribution.
/// 2. Flatten each frame's top-k indices in frame order.
/// 3. Count occurrences; rank by count descending, ties broken by first
///    appearance order in the flattened sequence.
/// 4. Take the k most persistent, prepend `last_top1`, dedup preserving the
///    first occurrence, truncate to k+1.
/// 5. Gather one confidence curve per survivor, rows in selection order.
///
/// With fewer than k+1 distinct candidates the selection is simply all of
/// them; a single-frame clip degenerates to that frame's top-k.
pub fn select_streaming(
    probs: &ProbabilityMatrix,
    k: usize,
    catalog: &LabelCatalog,
) -> Result<StreamingSelection> {
    let matrix = probs.matrix();
    let last_row = probs.last_row();
    let last_top1 = top_k_indices(last_row.view(), 1)
        .first()
        .copied()
        .unwrap_or(0);

    let mut flattened: Vec<usize> = Vec::with_capacity(probs.frame_count() * k);
    for row in matrix.axis_iter(Axis(0)) {
        flattened.extend(top_k_indices(row, k));
    }

    // Count occurrences and remember where each index first appeared so the
    // tie-break is reproducible.
    let mut distinct: Vec<(usize, usize, usize)> = Vec::new(); // (index, count, first_pos)
    for (position, &index) in flattened.iter().enumerate() {
        match distinct.iter_mut().find(|(seen, _, _)| *seen == index) {
            Some(entry) => entry.1 += 1,
            None => distinct.push((index, 1, position)),
        }
    }
    distinct.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let mut selected: Vec<usize> = Vec::with_capacity(k + 1);
    selected.push(last_top1);
    selected.extend(distinct.iter().take(k).map(|(index, _, _)| *index));

    let mut deduped: Vec<usize> = Vec::with_capacity(k + 1);
    for index in selected {
        if !deduped.contains(&index) {
            deduped.push(index);
        }
    }
    deduped.truncate(k + 1);

    let frame_count = probs.frame_count();
    let mut curves = Array2::zeros((deduped.len(), frame_count));
    for (row_index, &class_index) in deduped.iter().enumerate() {
        curves
            .row_mut(row_index)
            .assign(&probs.class_curve(class_index));
    }

    let labels = deduped
        .iter()
        .map(|&index| catalog.label(index).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;

    Ok(StreamingSelection {
        indices: deduped,
        curves,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn catalog() -> LabelCatalog {
        LabelCatalog::new(
            ["run", "jump", "swim", "walk", "sit", "cook"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap()
    }

    /// Per-frame top-2 of [0,1], [1,2], [2,0]; final argmax = 2. Flattened
    /// sequence 0,1,1,2,2,0 gives every index count 2, so first appearance
    /// decides: 0, 1, 2. Prepending last_top1=2 and deduping yields [2, 0, 1].
    fn worked_scenario() -> ProbabilityMatrix {
        ProbabilityMatrix::from_logits(arr2(&[
            [5.0, 4.0, 1.0, 0.0, 0.0, 0.0],
            [1.0, 5.0, 4.0, 0.0, 0.0, 0.0],
            [4.0, 1.0, 5.0, 0.0, 0.0, 0.0],
        ]))
    }

    #[test]
    fn worked_scenario_selects_swim_run_jump() {
        let selection = select_streaming(&worked_scenario(), 2, &catalog()).unwrap();
        assert_eq!(selection.indices, vec![2, 0, 1]);
        assert_eq!(selection.labels, vec!["swim", "run", "jump"]);
        assert_eq!(selection.curves.dim(), (3, 3));
    }

    #[test]
    fn selection_is_deterministic() {
        let probs = worked_scenario();
        let cat = catalog();
        let first = select_streaming(&probs, 2, &cat).unwrap();
        let second = select_streaming(&probs, 2, &cat).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn last_top1_always_leads() {
        let probs = ProbabilityMatrix::from_logits(arr2(&[
            [5.0, 4.0, 0.0, 0.0, 0.0, 0.0],
            [5.0, 4.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 9.0],
        ]));
        let selection = select_streaming(&probs, 2, &catalog()).unwrap();
        assert_eq!(selection.indices[0], 5);
        assert_eq!(selection.labels[0], "cook");
    }

    #[test]
    fn at_most_k_plus_one_tracked() {
        let probs = ProbabilityMatrix::from_logits(arr2(&[
            [6.0, 5.0, 4.0, 3.0, 2.0, 1.0],
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            [3.0, 6.0, 1.0, 5.0, 2.0, 4.0],
        ]));
        let selection = select_streaming(&probs, 2, &catalog()).unwrap();
        assert!(selection.tracked_count() <= 3);

        let mut unique = selection.indices.clone();
        unique.dedup();
        assert_eq!(unique, selection.indices, "indices must be distinct");
    }

    #[test]
    fn fewer_distinct_candidates_than_k_plus_one() {
        // Every frame agrees: only indices 0 and 1 ever appear.
        let probs = ProbabilityMatrix::from_logits(arr2(&[
            [5.0, 4.0, 0.0, 0.0, 0.0, 0.0],
            [5.0, 4.0, 0.0, 0.0, 0.0, 0.0],
        ]));
        let selection = select_streaming(&probs, 2, &catalog()).unwrap();
        assert_eq!(selection.indices, vec![0, 1]);
        assert_eq!(selection.curves.dim(), (2, 2));
    }

    #[test]
    fn single_frame_clip_degenerates_cleanly() {
        let probs =
            ProbabilityMatrix::from_logits(arr2(&[[1.0, 5.0, 4.0, 0.0, 0.0, 0.0]]));
        let selection = select_streaming(&probs, 2, &catalog()).unwrap();
        assert_eq!(selection.frame_count(), 1);
        assert_eq!(selection.indices[0], 1);
        assert!(selection.indices.contains(&2));
    }

    #[test]
    fn curves_match_source_columns() {
        let probs = worked_scenario();
        let selection = select_streaming(&probs, 2, &catalog()).unwrap();
        for (row, &class_index) in selection.indices.iter().enumerate() {
            assert_eq!(
                selection.curves.row(row).to_owned(),
                probs.class_curve(class_index)
            );
        }
    }

    #[test]
    fn top_k_labels_best_first() {
        let row = worked_scenario().last_row();
        let top = top_k_labels(&row, 3, &catalog()).unwrap();
        assert_eq!(top[0].0, "swim");
        assert_eq!(top[1].0, "run");
        assert_eq!(top[2].0, "jump");
        assert!(top[0].1 >= top[1].1 && top[1].1 >= top[2].1);
    }

    #[test]
    fn top_k_indices_handles_short_rows() {
        let row = Array1::from_vec(vec![0.3, 0.7]);
        assert_eq!(top_k_indices(row.view(), 5), vec![1, 0]);
    }
}
