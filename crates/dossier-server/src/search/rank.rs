// crates/dossier-server/src/search/rank.rs
// Composite score for search candidates

use chrono::NaiveDate;
use dossier_types::DocumentKind;

use crate::config::RankingConfig;
use crate::db::FtsCandidate;

/// Age at which the recency bonus reaches zero (five years).
const RECENCY_HORIZON_DAYS: f64 = 1826.0;

/// Kind weight from the ranking configuration.
pub fn kind_weight(kind: DocumentKind, cfg: &RankingConfig) -> f64 {
    match kind {
        DocumentKind::Deposition => cfg.weight_deposition,
        DocumentKind::Filing => cfg.weight_filing,
        DocumentKind::Email => cfg.weight_email,
        DocumentKind::Log => cfg.weight_log,
        DocumentKind::Other => cfg.weight_other,
    }
}

/// Linear recency decay: 1.0 today, 0.0 at the five-year horizon.
/// Documents without a timestamp get no bonus.
pub fn recency_decay(timestamp: Option<NaiveDate>, today: NaiveDate) -> f64 {
    match timestamp {
        Some(t) => {
            let age_days = (today - t).num_days() as f64;
            (1.0 - age_days / RECENCY_HORIZON_DAYS).clamp(0.0, 1.0)
        }
        None => 0.0,
    }
}

/// Composite score: raw lexical relevance plus recency bonus plus
/// document-kind weight.
pub fn compose_score(
    lexical: f64,
    kind: DocumentKind,
    timestamp: Option<NaiveDate>,
    today: NaiveDate,
    cfg: &RankingConfig,
) -> f64 {
    lexical + cfg.recency_weight * recency_decay(timestamp, today) + kind_weight(kind, cfg)
}

/// Order candidates by composite score. Ties break on higher raw lexical
/// score, then newer timestamp, then lower doc id.
pub fn order_candidates(
    mut candidates: Vec<(FtsCandidate, f64)>,
) -> Vec<(FtsCandidate, f64)> {
    candidates.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .total_cmp(score_a)
            .then_with(|| b.lexical.total_cmp(&a.lexical))
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(doc_id: i64, lexical: f64, kind: DocumentKind, ts: Option<&str>) -> FtsCandidate {
        FtsCandidate {
            doc_id,
            title: format!("doc {doc_id}"),
            body: String::new(),
            kind,
            timestamp: ts.and_then(|t| NaiveDate::parse_from_str(t, "%Y-%m-%d").ok()),
            sender: None,
            lexical,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    #[test]
    fn test_recency_decay_bounds() {
        let t = today();
        assert_eq!(recency_decay(Some(t), t), 1.0);
        // Older than five years: no bonus
        assert_eq!(
            recency_decay(NaiveDate::from_ymd_opt(2002, 6, 1), t),
            0.0
        );
        // Future timestamps clamp rather than overshoot
        assert_eq!(
            recency_decay(NaiveDate::from_ymd_opt(2030, 1, 1), t),
            1.0
        );
        assert_eq!(recency_decay(None, t), 0.0);
    }

    #[test]
    fn test_recency_decay_is_linear() {
        let t = today();
        let half = recency_decay(t.checked_sub_days(chrono::Days::new(913)), t);
        assert!((half - 0.5).abs() < 0.01, "decay at 2.5y should be ~0.5, got {half}");
    }

    #[test]
    fn test_kind_weight_ordering() {
        let cfg = RankingConfig::default();
        let t = today();
        let depo = compose_score(1.0, DocumentKind::Deposition, None, t, &cfg);
        let email = compose_score(1.0, DocumentKind::Email, None, t, &cfg);
        let log = compose_score(1.0, DocumentKind::Log, None, t, &cfg);
        assert!(depo > email);
        assert!(email > log);
    }

    #[test]
    fn test_recent_email_can_outrank_old_deposition() {
        let cfg = RankingConfig::default();
        let t = today();
        let old_depo = compose_score(
            1.0,
            DocumentKind::Deposition,
            NaiveDate::from_ymd_opt(2004, 1, 1),
            t,
            &cfg,
        );
        let fresh_email =
            compose_score(1.0, DocumentKind::Email, Some(t), t, &cfg);
        assert!(fresh_email > old_depo);
    }

    #[test]
    fn test_tie_breaks_lexical_then_timestamp_then_id() {
        let cfg = RankingConfig::default();
        let t = today();

        // Equal composite via equal inputs: same kind, no timestamps
        let a = candidate(20, 2.0, DocumentKind::Email, None);
        let b = candidate(10, 2.0, DocumentKind::Email, None);
        let scored: Vec<_> = [a, b]
            .into_iter()
            .map(|c| {
                let s = compose_score(c.lexical, c.kind, c.timestamp, t, &cfg);
                (c, s)
            })
            .collect();
        let ordered = order_candidates(scored);
        // Fully tied: lower doc id first
        assert_eq!(ordered[0].0.doc_id, 10);
        assert_eq!(ordered[1].0.doc_id, 20);
    }

    #[test]
    fn test_higher_composite_wins_regardless_of_id() {
        let cfg = RankingConfig::default();
        let t = today();
        let weak = candidate(1, 0.5, DocumentKind::Log, None);
        let strong = candidate(999, 3.0, DocumentKind::Deposition, None);
        let scored: Vec<_> = [weak, strong]
            .into_iter()
            .map(|c| {
                let s = compose_score(c.lexical, c.kind, c.timestamp, t, &cfg);
                (c, s)
            })
            .collect();
        let ordered = order_candidates(scored);
        assert_eq!(ordered[0].0.doc_id, 999);
    }
}
