//! Feedback ingestion and on-demand aggregation.
//!
//! Ingestion validates the rating, scores the comment with the keyword
//! tagger, persists the row (one per user per deployment), and notifies the
//! deployment owner. Aggregation is a pure read over loaded rows: average
//! rating, sentiment distribution, category sums, top categories, and a
//! time-bucketed trend.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;
use crate::errors::MarketError;
use crate::models::{AgentFeedback, Deployment, User};
use crate::sentiment;

/// Score magnitude a row needs to count as positive/negative in the summary
/// distribution. Deliberately stricter than the ±0.1 ingestion label in
/// `sentiment.rs`: the distribution only counts strongly polarized feedback.
pub const DISTRIBUTION_THRESHOLD: f64 = 0.5;

/// How many categories the summary surfaces.
const TOP_CATEGORY_LIMIT: usize = 5;

// ── Ingestion ────────────────────────────────────────────────────────

/// Validate, score, persist, and notify. One review per (user, deployment);
/// the unique constraint in the schema backstops the pre-check.
pub async fn ingest(
    db: &DbHandle,
    deployment: &Deployment,
    reviewer: &User,
    rating: i64,
    comment: Option<String>,
    categories: BTreeMap<String, f64>,
) -> Result<AgentFeedback, MarketError> {
    if !(1..=5).contains(&rating) {
        return Err(MarketError::validation(
            "rating",
            format!("must be between 1 and 5, got {}", rating),
        ));
    }

    let score = comment.as_deref().and_then(sentiment::score);
    let label = score.map(sentiment::label);

    let deployment_id = deployment.id;
    let owner_id = deployment.owner_id;
    let deployment_name = deployment.name.clone();
    let reviewer_id = reviewer.id;
    let reviewer_name = reviewer.name.clone();

    let feedback = db
        .call(move |db| {
            if db.get_feedback_by_user(deployment_id, reviewer_id)?.is_some() {
                return Err(MarketError::validation(
                    "deployment",
                    format!("user has already reviewed deployment {}", deployment_id),
                ));
            }
            let feedback = db.create_feedback(
                deployment_id,
                reviewer_id,
                rating,
                comment.as_deref(),
                &categories,
                score,
                label.as_ref(),
            )?;
            db.create_notification(
                owner_id,
                "feedback",
                &format!(
                    "{} left a {}-star review on {}",
                    reviewer_name, rating, deployment_name
                ),
            )?;
            Ok(feedback)
        })
        .await?;

    tracing::info!(
        deployment_id,
        rating,
        sentiment = label.map(|l| l.as_str()).unwrap_or("unscored"),
        "feedback ingested"
    );
    Ok(feedback)
}

// ── Aggregation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentDistribution {
    pub positive: i64,
    pub negative: i64,
    pub neutral: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSummary {
    pub total_feedback: i64,
    pub average_rating: f64,
    pub sentiment_distribution: SentimentDistribution,
    pub top_categories: Vec<CategoryCount>,
    pub recent_feedback: Vec<AgentFeedback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub period: String,
    pub count: i64,
    pub average_rating: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackAnalytics {
    pub sentiment_distribution: SentimentDistribution,
    pub category_analysis: BTreeMap<String, f64>,
    pub trend: Vec<TrendPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendGrouping {
    Day,
    Week,
    Month,
}

impl FromStr for TrendGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(format!("Invalid groupBy: {}", s)),
        }
    }
}

impl TrendGrouping {
    fn bucket_format(&self) -> &'static str {
        match self {
            Self::Day => "%Y-%m-%d",
            Self::Week => "%G-W%V",
            Self::Month => "%Y-%m",
        }
    }
}

/// Summarize a deployment's feedback rows (already range-filtered by the
/// caller). `recent_limit` caps how many rows are echoed back verbatim.
pub fn summarize(rows: &[AgentFeedback], recent_limit: usize) -> FeedbackSummary {
    FeedbackSummary {
        total_feedback: rows.len() as i64,
        average_rating: average_rating(rows),
        sentiment_distribution: sentiment_distribution(rows),
        top_categories: top_categories(rows),
        recent_feedback: rows.iter().take(recent_limit).cloned().collect(),
    }
}

pub fn analyze(rows: &[AgentFeedback], grouping: TrendGrouping) -> FeedbackAnalytics {
    FeedbackAnalytics {
        sentiment_distribution: sentiment_distribution(rows),
        category_analysis: category_analysis(rows),
        trend: trend(rows, grouping),
    }
}

fn average_rating(rows: &[AgentFeedback]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(|f| f.rating as f64).sum::<f64>() / rows.len() as f64
}

/// Bucket rows by stored sentiment score at ±[`DISTRIBUTION_THRESHOLD`].
/// Unscored rows count as neutral.
fn sentiment_distribution(rows: &[AgentFeedback]) -> SentimentDistribution {
    let mut distribution = SentimentDistribution {
        positive: 0,
        negative: 0,
        neutral: 0,
    };
    for row in rows {
        match row.sentiment_score {
            Some(score) if score > DISTRIBUTION_THRESHOLD => distribution.positive += 1,
            Some(score) if score < -DISTRIBUTION_THRESHOLD => distribution.negative += 1,
            _ => distribution.neutral += 1,
        }
    }
    distribution
}

/// Sum of per-category weights across all rows.
fn category_analysis(rows: &[AgentFeedback]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for row in rows {
        for (category, weight) in &row.categories {
            *sums.entry(category.clone()).or_insert(0.0) += weight;
        }
    }
    sums
}

/// Categories by mention count, descending, top 5. Ties break by name so
/// the output is deterministic.
fn top_categories(rows: &[AgentFeedback]) -> Vec<CategoryCount> {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for row in rows {
        for category in row.categories.keys() {
            *counts.entry(category).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<CategoryCount> = counts
        .into_iter()
        .map(|(category, count)| CategoryCount {
            category: category.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then(a.category.cmp(&b.category)));
    ranked.truncate(TOP_CATEGORY_LIMIT);
    ranked
}

/// Rating counts and averages bucketed by period, ascending. Rows whose
/// timestamp cannot be parsed are skipped.
fn trend(rows: &[AgentFeedback], grouping: TrendGrouping) -> Vec<TrendPoint> {
    let mut buckets: BTreeMap<String, (i64, f64)> = BTreeMap::new();
    for row in rows {
        let Ok(timestamp) = NaiveDateTime::parse_from_str(&row.created_at, "%Y-%m-%d %H:%M:%S")
        else {
            continue;
        };
        let period = timestamp.format(grouping.bucket_format()).to_string();
        let entry = buckets.entry(period).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += row.rating as f64;
    }
    buckets
        .into_iter()
        .map(|(period, (count, rating_sum))| TrendPoint {
            period,
            count,
            average_rating: rating_sum / count as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MarketDb;
    use crate::models::{AccessLevel, SubscriptionTier};

    fn row(rating: i64, score: Option<f64>, created_at: &str) -> AgentFeedback {
        AgentFeedback {
            id: 0,
            deployment_id: 1,
            user_id: 1,
            rating,
            comment: None,
            categories: BTreeMap::new(),
            sentiment_score: score,
            sentiment_label: None,
            creator_response: None,
            response_at: None,
            created_at: created_at.to_string(),
        }
    }

    fn row_with_categories(rating: i64, categories: &[(&str, f64)]) -> AgentFeedback {
        let mut r = row(rating, None, "2024-03-01 12:00:00");
        r.categories = categories
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        r
    }

    #[test]
    fn test_average_rating_exact() {
        let rows = [
            row(5, None, "2024-03-01 10:00:00"),
            row(5, None, "2024-03-01 11:00:00"),
            row(1, None, "2024-03-01 12:00:00"),
            row(3, None, "2024-03-01 13:00:00"),
        ];
        let summary = summarize(&rows, 10);
        assert_eq!(summary.average_rating, 3.5);
        assert_eq!(summary.total_feedback, 4);
    }

    #[test]
    fn test_average_rating_empty_is_zero() {
        let summary = summarize(&[], 10);
        assert_eq!(summary.average_rating, 0.0);
        assert_eq!(summary.total_feedback, 0);
        assert!(summary.recent_feedback.is_empty());
    }

    #[test]
    fn test_sentiment_distribution_uses_half_threshold() {
        // 0.3 is within (-0.5, 0.5), so it lands in neutral even though the
        // ingestion label would have called it positive.
        let rows = [
            row(5, Some(0.6), "2024-03-01 10:00:00"),
            row(1, Some(-0.6), "2024-03-01 11:00:00"),
            row(3, Some(0.0), "2024-03-01 12:00:00"),
            row(4, Some(0.3), "2024-03-01 13:00:00"),
        ];
        let summary = summarize(&rows, 10);
        assert_eq!(
            summary.sentiment_distribution,
            SentimentDistribution {
                positive: 1,
                negative: 1,
                neutral: 2
            }
        );
    }

    #[test]
    fn test_unscored_rows_count_as_neutral() {
        let rows = [row(4, None, "2024-03-01 10:00:00")];
        let dist = sentiment_distribution(&rows);
        assert_eq!(dist.neutral, 1);
    }

    #[test]
    fn test_category_analysis_sums_weights() {
        let rows = [
            row_with_categories(5, &[("accuracy", 0.8), ("speed", 0.2)]),
            row_with_categories(4, &[("accuracy", 0.4)]),
        ];
        let analytics = analyze(&rows, TrendGrouping::Day);
        assert_eq!(analytics.category_analysis["accuracy"], 1.2000000000000002);
        assert_eq!(analytics.category_analysis["speed"], 0.2);
    }

    #[test]
    fn test_top_categories_ranked_and_capped_at_five() {
        let rows = [
            row_with_categories(5, &[("a", 1.0), ("b", 1.0), ("c", 1.0)]),
            row_with_categories(4, &[("a", 1.0), ("b", 1.0), ("d", 1.0)]),
            row_with_categories(3, &[("a", 1.0), ("e", 1.0), ("f", 1.0)]),
        ];
        let summary = summarize(&rows, 10);
        assert_eq!(summary.top_categories.len(), 5);
        assert_eq!(summary.top_categories[0].category, "a");
        assert_eq!(summary.top_categories[0].count, 3);
        assert_eq!(summary.top_categories[1].category, "b");
        assert_eq!(summary.top_categories[1].count, 2);
        // Singles tie-break alphabetically
        assert_eq!(summary.top_categories[2].category, "c");
    }

    #[test]
    fn test_recent_feedback_respects_limit() {
        let rows: Vec<AgentFeedback> = (0..8)
            .map(|i| row(5, None, &format!("2024-03-0{} 10:00:00", i + 1)))
            .collect();
        let summary = summarize(&rows, 3);
        assert_eq!(summary.recent_feedback.len(), 3);
    }

    #[test]
    fn test_trend_buckets_by_day() {
        let rows = [
            row(5, None, "2024-03-01 10:00:00"),
            row(3, None, "2024-03-01 18:00:00"),
            row(1, None, "2024-03-02 09:00:00"),
        ];
        let analytics = analyze(&rows, TrendGrouping::Day);
        assert_eq!(analytics.trend.len(), 2);
        assert_eq!(analytics.trend[0].period, "2024-03-01");
        assert_eq!(analytics.trend[0].count, 2);
        assert_eq!(analytics.trend[0].average_rating, 4.0);
        assert_eq!(analytics.trend[1].period, "2024-03-02");
        assert_eq!(analytics.trend[1].average_rating, 1.0);
    }

    #[test]
    fn test_trend_buckets_by_month() {
        let rows = [
            row(4, None, "2024-03-05 10:00:00"),
            row(2, None, "2024-04-20 10:00:00"),
        ];
        let analytics = analyze(&rows, TrendGrouping::Month);
        let periods: Vec<&str> = analytics.trend.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(periods, vec!["2024-03", "2024-04"]);
    }

    #[test]
    fn test_trend_grouping_parse() {
        assert_eq!("day".parse::<TrendGrouping>().unwrap(), TrendGrouping::Day);
        assert_eq!("week".parse::<TrendGrouping>().unwrap(), TrendGrouping::Week);
        assert_eq!("month".parse::<TrendGrouping>().unwrap(), TrendGrouping::Month);
        assert!("year".parse::<TrendGrouping>().is_err());
    }

    async fn seeded_db() -> (DbHandle, Deployment, User, User) {
        let db = DbHandle::new(MarketDb::new_in_memory().unwrap());
        let (deployment, owner, reviewer) = db
            .call(|db| {
                let owner = db.create_user("owner", &SubscriptionTier::Free)?;
                let reviewer = db.create_user("reviewer", &SubscriptionTier::Free)?;
                let created = db.create_deployment(
                    owner.id,
                    "translator",
                    "",
                    &AccessLevel::Public,
                    "webhook",
                    "1.0.0",
                    None,
                )?;
                Ok((created.deployment, owner, reviewer))
            })
            .await
            .unwrap();
        (db, deployment, owner, reviewer)
    }

    #[tokio::test]
    async fn test_ingest_scores_comment_and_notifies_owner() {
        let (db, deployment, owner, reviewer) = seeded_db().await;

        let feedback = ingest(
            &db,
            &deployment,
            &reviewer,
            5,
            Some("this is great and wonderful".to_string()),
            BTreeMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(feedback.rating, 5);
        assert!((feedback.sentiment_score.unwrap() - 0.4).abs() < f64::EPSILON);
        assert_eq!(
            feedback.sentiment_label,
            Some(crate::models::SentimentLabel::Positive)
        );

        let owner_id = owner.id;
        let notifications = db
            .call(move |db| Ok(db.list_notifications(owner_id)?))
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].message.contains("5-star"));
    }

    #[tokio::test]
    async fn test_ingest_without_comment_leaves_score_unset() {
        let (db, deployment, _owner, _reviewer) = seeded_db().await;
        for rating in 1..=5 {
            // Fresh reviewer each round: one review per (user, deployment)
            let user = db
                .call(move |db| {
                    Ok(db.create_user(&format!("r{}", rating), &SubscriptionTier::Free)?)
                })
                .await
                .unwrap();
            let feedback = ingest(&db, &deployment, &user, rating, None, BTreeMap::new())
                .await
                .unwrap();
            assert_eq!(feedback.rating, rating);
            assert_eq!(feedback.sentiment_score, None);
            assert_eq!(feedback.sentiment_label, None);
        }
    }

    #[tokio::test]
    async fn test_ingest_rejects_out_of_range_rating() {
        let (db, deployment, _owner, reviewer) = seeded_db().await;
        for rating in [0, 6, -1, 100] {
            let err = ingest(&db, &deployment, &reviewer, rating, None, BTreeMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, MarketError::Validation { .. }));
        }
    }

    #[tokio::test]
    async fn test_ingest_rejects_second_review_from_same_user() {
        let (db, deployment, _owner, reviewer) = seeded_db().await;
        ingest(&db, &deployment, &reviewer, 4, None, BTreeMap::new())
            .await
            .unwrap();
        let err = ingest(&db, &deployment, &reviewer, 2, None, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation { .. }));
    }
}
