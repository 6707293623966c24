use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub subscription_tier: SubscriptionTier,
    pub api_token: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }

    /// Ordering used for access-level checks: free < basic < premium.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Basic => 1,
            Self::Premium => 2,
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Active,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "deploying" => Ok(Self::Deploying),
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Public,
    Basic,
    Premium,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }

    /// Minimum subscription rank a non-owner needs to view this deployment.
    pub fn required_rank(&self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Basic => 1,
            Self::Premium => 2,
        }
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid access level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: String,
    pub status: DeploymentStatus,
    pub access_level: AccessLevel,
    pub framework: String,
    pub version: String,
    pub webhook_url: Option<String>,
    pub download_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Deployment {
    /// Whether `viewer` may read this deployment, its metrics, and its
    /// feedback aggregates. The owner always can; everyone else is gated by
    /// the access level against their subscription tier.
    pub fn viewable_by(&self, viewer: Option<&User>) -> bool {
        match viewer {
            Some(user) if user.id == self.owner_id => true,
            Some(user) => user.subscription_tier.rank() >= self.access_level.required_rank(),
            None => self.access_level == AccessLevel::Public,
        }
    }
}

/// Rolling metrics snapshot for a deployment. Created zeroed alongside the
/// deployment row and recomputed from resolved executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMetrics {
    pub deployment_id: i64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub active_users: i64,
    pub total_requests: i64,
    pub average_response_time: f64,
    pub requests_per_minute: f64,
    pub average_tokens_used: f64,
    pub cost_per_request: f64,
    pub total_cost: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Resolved executions are the only ones that feed the metrics row.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: i64,
    pub deployment_id: i64,
    pub user_id: Option<i64>,
    pub status: ExecutionStatus,
    pub response_time_ms: Option<f64>,
    pub tokens_used: Option<i64>,
    pub cost: Option<f64>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            _ => Err(format!("Invalid sentiment label: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFeedback {
    pub id: i64,
    pub deployment_id: i64,
    pub user_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    /// Category name -> weight, as submitted by the reviewer.
    pub categories: BTreeMap<String, f64>,
    pub sentiment_score: Option<f64>,
    pub sentiment_label: Option<SentimentLabel>,
    pub creator_response: Option<String>,
    pub response_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub message: String,
    pub read: bool,
    pub created_at: String,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentWithMetrics {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub metrics: DeploymentMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_status_roundtrip() {
        for s in &["pending", "deploying", "active", "stopped", "failed"] {
            let parsed: DeploymentStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_access_level_roundtrip() {
        for s in &["public", "basic", "premium"] {
            let parsed: AccessLevel = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("vip".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn test_subscription_tier_roundtrip() {
        for s in &["free", "basic", "premium"] {
            let parsed: SubscriptionTier = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("gold".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_execution_status_resolved() {
        assert!(!ExecutionStatus::Pending.is_resolved());
        assert!(ExecutionStatus::Completed.is_resolved());
        assert!(ExecutionStatus::Failed.is_resolved());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::Deploying).unwrap(),
            "\"deploying\""
        );
        assert_eq!(
            serde_json::to_string(&AccessLevel::Premium).unwrap(),
            "\"premium\""
        );
        assert_eq!(
            serde_json::to_string(&SentimentLabel::Neutral).unwrap(),
            "\"neutral\""
        );
    }

    fn user(id: i64, tier: SubscriptionTier) -> User {
        User {
            id,
            name: "u".to_string(),
            subscription_tier: tier,
            api_token: "tok".to_string(),
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    fn deployment(owner_id: i64, access: AccessLevel) -> Deployment {
        Deployment {
            id: 1,
            owner_id,
            name: "agent".to_string(),
            description: String::new(),
            status: DeploymentStatus::Pending,
            access_level: access,
            framework: "webhook".to_string(),
            version: "0.1.0".to_string(),
            webhook_url: None,
            download_count: 0,
            created_at: "2024-01-01 00:00:00".to_string(),
            updated_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn test_public_deployment_viewable_anonymously() {
        let d = deployment(1, AccessLevel::Public);
        assert!(d.viewable_by(None));
        assert!(d.viewable_by(Some(&user(2, SubscriptionTier::Free))));
    }

    #[test]
    fn test_premium_deployment_gated_by_tier() {
        let d = deployment(1, AccessLevel::Premium);
        assert!(!d.viewable_by(None));
        assert!(!d.viewable_by(Some(&user(2, SubscriptionTier::Basic))));
        assert!(d.viewable_by(Some(&user(2, SubscriptionTier::Premium))));
        // Owner bypasses the tier check entirely
        assert!(d.viewable_by(Some(&user(1, SubscriptionTier::Free))));
    }

    #[test]
    fn test_metrics_serializes_camel_case() {
        let m = DeploymentMetrics {
            deployment_id: 1,
            error_rate: 0.25,
            success_rate: 0.75,
            active_users: 3,
            total_requests: 4,
            average_response_time: 120.0,
            requests_per_minute: 2.0,
            average_tokens_used: 512.0,
            cost_per_request: 0.01,
            total_cost: 0.04,
            updated_at: "2024-01-01 00:00:00".to_string(),
        };
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"errorRate\":0.25"));
        assert!(json.contains("\"averageResponseTime\":120.0"));
        assert!(json.contains("\"totalRequests\":4"));
    }
}
