// tests/anomaly_properties.rs
//! Property checks for normalization, labeling and attribution

use chain_anomaly::anomaly_detection::{
    label, AttributionEngine, Feature, FeatureMatrix, FeatureSchema, IsolationForest,
    NormalizationParameters,
};
use proptest::prelude::*;

fn schema(width: usize) -> FeatureSchema {
    FeatureSchema::new(Feature::ALL[..width].to_vec()).unwrap()
}

fn matrix_strategy(
    rows: std::ops::Range<usize>,
    widths: std::ops::Range<usize>,
) -> impl Strategy<Value = FeatureMatrix> {
    widths.prop_flat_map(move |width| {
        prop::collection::vec(prop::collection::vec(-1_000.0f64..1_000.0, width), rows.clone())
            .prop_map(move |rows| FeatureMatrix::new(schema(width), rows).unwrap())
    })
}

mod proptest_normalization {
    use super::*;

    proptest! {
        #[test]
        fn test_normalize_round_trip(matrix in matrix_strategy(1..20, 1..6)) {
            let params = NormalizationParameters::fit(&matrix).unwrap();
            let restored = params.inverse_transform(&params.transform(&matrix).unwrap()).unwrap();

            for (original, back) in matrix.rows.iter().zip(&restored.rows) {
                for (a, b) in original.values().iter().zip(back.values()) {
                    prop_assert!((a - b).abs() <= 1e-6 * (1.0 + a.abs()), "{} vs {}", a, b);
                }
            }
        }

        #[test]
        fn test_normalized_columns_are_centered(matrix in matrix_strategy(2..20, 1..6)) {
            let params = NormalizationParameters::fit(&matrix).unwrap();
            let normalized = params.transform(&matrix).unwrap();
            for j in 0..normalized.width() {
                let column = normalized.column(j);
                let mean = column.iter().sum::<f64>() / column.len() as f64;
                prop_assert!(mean.abs() < 1e-6);
            }
        }
    }
}

mod proptest_labeling {
    use super::*;

    proptest! {
        #[test]
        fn test_label_count_matches_contamination(
            scores in prop::collection::vec(0.0f64..1.0, 1..200),
            contamination in 0.001f64..=0.5,
        ) {
            let labels = label(&scores, contamination).unwrap();
            let flagged = labels.iter().filter(|l| l.is_anomalous()).count();
            let expected = (contamination * scores.len() as f64).round() as usize;
            prop_assert_eq!(flagged, expected);
        }

        #[test]
        fn test_label_monotone_in_contamination(
            scores in prop::collection::vec(0.0f64..1.0, 1..200),
            low in 0.001f64..=0.5,
            high in 0.001f64..=0.5,
        ) {
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            let narrow = label(&scores, low).unwrap();
            let wide = label(&scores, high).unwrap();
            for (n, w) in narrow.iter().zip(&wide) {
                prop_assert!(!n.is_anomalous() || w.is_anomalous());
            }
        }

        #[test]
        fn test_flagged_scores_dominate(
            scores in prop::collection::vec(0.0f64..1.0, 2..100),
            contamination in 0.01f64..=0.5,
        ) {
            let labels = label(&scores, contamination).unwrap();
            let min_flagged = scores.iter().zip(&labels)
                .filter(|(_, l)| l.is_anomalous())
                .map(|(s, _)| *s)
                .fold(f64::INFINITY, f64::min);
            let max_normal = scores.iter().zip(&labels)
                .filter(|(_, l)| !l.is_anomalous())
                .map(|(s, _)| *s)
                .fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(min_flagged >= max_normal);
        }
    }
}

mod proptest_attribution {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_contributions_sum_to_score(
            matrix in matrix_strategy(4..24, 1..5),
            seed in any::<u64>(),
        ) {
            let mut forest = IsolationForest::new(16, 64).with_seed(Some(seed));
            forest.fit(&matrix).unwrap();
            let report = AttributionEngine::default().explain(&forest, &matrix).unwrap();

            prop_assert_eq!(report.records.len(), matrix.len());
            for (row, attribution) in matrix.rows.iter().zip(&report.records) {
                let score = forest.score(row.values()).unwrap();
                prop_assert!((attribution.score - score).abs() < 1e-12);
                prop_assert!((attribution.reconstructed_score() - score).abs() < 1e-9);
                prop_assert!((attribution.baseline - report.baseline).abs() < 1e-12);
            }
            prop_assert!(report.importances.iter().all(|i| i.value >= 0.0));
        }
    }
}
