// Rule matching: which queue owns an incoming lead.
//
// Rules are an ordered OR per queue: the first rule (highest priority) whose
// values intersect the lead's attributes wins the queue. A queue with zero
// rules is an unconditional fallback candidate.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::{QueueRule, RoundRobinQueue};
use lattice_shared::Lead;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchType {
    Source,
    Webhook,
    WhatsappSession,
    MetaForm,
    WebsiteCategory,
    CampaignContains,
    Tag,
    City,
    InterestProperty,
    InterestPlan,
}

impl RuleMatchType {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(&format!("\"{}\"", raw)).ok()
    }
}

/// The lead attributes rule matching reads, loaded once per decision.
#[derive(Debug, Clone, Default)]
pub struct LeadProfile {
    pub source: Option<String>,
    pub webhook_id: Option<Uuid>,
    pub whatsapp_session_id: Option<Uuid>,
    pub meta_form_id: Option<String>,
    pub website_category: Option<String>,
    pub campaign: Option<String>,
    pub city: Option<String>,
    pub tag_ids: Vec<Uuid>,
    pub interest_property_id: Option<Uuid>,
    pub interest_plan_id: Option<Uuid>,
}

impl LeadProfile {
    pub async fn load(pool: &PgPool, lead: &Lead) -> Result<Self, sqlx::Error> {
        let tag_ids: Vec<Uuid> = sqlx::query_scalar("SELECT tag_id FROM lead_tags WHERE lead_id = $1")
            .bind(lead.id)
            .fetch_all(pool)
            .await?;

        Ok(Self {
            source: lead.source.clone(),
            webhook_id: lead.webhook_id,
            whatsapp_session_id: lead.whatsapp_session_id,
            meta_form_id: lead.meta_form_id.clone(),
            website_category: lead.website_category.clone(),
            campaign: lead.campaign.clone(),
            city: lead.city.clone(),
            tag_ids,
            interest_property_id: lead.interest_property_id,
            interest_plan_id: lead.interest_plan_id,
        })
    }
}

/// Does one rule accept this lead? Exact set membership for most types,
/// substring containment for `campaign_contains`.
pub fn rule_matches(rule: &QueueRule, profile: &LeadProfile) -> bool {
    let Some(match_type) = RuleMatchType::parse(&rule.match_type) else {
        // A rule of an unknown type never matches; it must not accidentally
        // capture every lead.
        return false;
    };

    match match_type {
        RuleMatchType::Source => contains_opt(&rule.match_values, profile.source.as_deref()),
        RuleMatchType::Webhook => contains_uuid(&rule.match_values, profile.webhook_id),
        RuleMatchType::WhatsappSession => contains_uuid(&rule.match_values, profile.whatsapp_session_id),
        RuleMatchType::MetaForm => contains_opt(&rule.match_values, profile.meta_form_id.as_deref()),
        RuleMatchType::WebsiteCategory => contains_opt(&rule.match_values, profile.website_category.as_deref()),
        RuleMatchType::CampaignContains => match profile.campaign.as_deref() {
            Some(campaign) => {
                let campaign = campaign.to_lowercase();
                rule.match_values.iter().any(|v| campaign.contains(&v.to_lowercase()))
            }
            None => false,
        },
        RuleMatchType::Tag => profile
            .tag_ids
            .iter()
            .any(|tag_id| contains_uuid(&rule.match_values, Some(*tag_id))),
        RuleMatchType::City => contains_opt(&rule.match_values, profile.city.as_deref()),
        RuleMatchType::InterestProperty => contains_uuid(&rule.match_values, profile.interest_property_id),
        RuleMatchType::InterestPlan => contains_uuid(&rule.match_values, profile.interest_plan_id),
    }
}

fn contains_opt(values: &[String], attribute: Option<&str>) -> bool {
    match attribute {
        Some(attribute) => values.iter().any(|v| v.eq_ignore_ascii_case(attribute)),
        None => false,
    }
}

fn contains_uuid(values: &[String], attribute: Option<Uuid>) -> bool {
    match attribute {
        Some(id) => {
            let id = id.to_string();
            values.iter().any(|v| v.eq_ignore_ascii_case(&id))
        }
        None => false,
    }
}

/// The queue-selection verdict for one lead.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMatch {
    /// A rule of this queue matched.
    Rule { queue_id: Uuid, rule_id: Uuid },
    /// No rule matched anywhere; a zero-rule queue catches the lead.
    Fallback { queue_id: Uuid },
    /// No queue wants the lead; it goes to the admin fallback.
    None,
}

/// Walk active queues in tenant precedence order (creation order). The first
/// queue with a matching rule wins; the first zero-rule queue is remembered
/// as the unconditional fallback.
pub fn select_queue(queues: &[(RoundRobinQueue, Vec<QueueRule>)], profile: &LeadProfile) -> QueueMatch {
    let mut fallback: Option<Uuid> = None;

    for (queue, rules) in queues {
        if !queue.is_active {
            continue;
        }

        let active_rules: Vec<&QueueRule> = rules.iter().filter(|r| r.is_active).collect();

        if active_rules.is_empty() {
            if fallback.is_none() {
                fallback = Some(queue.id);
            }
            continue;
        }

        // highest priority first
        let mut ordered = active_rules;
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        if let Some(rule) = ordered.into_iter().find(|rule| rule_matches(rule, profile)) {
            return QueueMatch::Rule {
                queue_id: queue.id,
                rule_id: rule.id,
            };
        }
    }

    match fallback {
        Some(queue_id) => QueueMatch::Fallback { queue_id },
        None => QueueMatch::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn queue(name: &str) -> RoundRobinQueue {
        RoundRobinQueue {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: name.to_string(),
            strategy: "simple".to_string(),
            target_pipeline_id: None,
            target_stage_id: None,
            is_active: true,
            settings: json!({}),
            reentry_behavior: "redistribute".to_string(),
            ai_agent_id: None,
            rotation_cursor: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn rule(queue_id: Uuid, match_type: &str, values: Vec<String>, priority: i32) -> QueueRule {
        QueueRule {
            id: Uuid::new_v4(),
            queue_id,
            match_type: match_type.to_string(),
            match_values: values,
            priority,
            is_active: true,
        }
    }

    #[test]
    fn test_tag_rule_wins_over_fallback() {
        let hot = Uuid::new_v4();
        let tagged_queue = queue("Hot leads");
        let tag_rule = rule(tagged_queue.id, "tag", vec![hot.to_string()], 10);
        let fallback_queue = queue("Everything else");

        let queues = vec![
            (tagged_queue.clone(), vec![tag_rule]),
            (fallback_queue.clone(), vec![]),
        ];

        let tagged_lead = LeadProfile {
            tag_ids: vec![hot],
            ..Default::default()
        };
        assert!(matches!(
            select_queue(&queues, &tagged_lead),
            QueueMatch::Rule { queue_id, .. } if queue_id == tagged_queue.id
        ));

        // untagged lead falls through to the zero-rule queue
        let untagged = LeadProfile::default();
        assert!(matches!(
            select_queue(&queues, &untagged),
            QueueMatch::Fallback { queue_id } if queue_id == fallback_queue.id
        ));
    }

    #[test]
    fn test_no_match_and_no_fallback() {
        let q = queue("Campaigns");
        let r = rule(q.id, "campaign_contains", vec!["summer".to_string()], 5);

        let queues = vec![(q, vec![r])];
        let profile = LeadProfile {
            campaign: Some("winter-promo".to_string()),
            ..Default::default()
        };

        assert_eq!(select_queue(&queues, &profile), QueueMatch::None);
    }

    #[test]
    fn test_campaign_contains_is_substring_match() {
        let q = queue("Campaigns");
        let r = rule(q.id, "campaign_contains", vec!["Summer".to_string()], 5);
        let queues = vec![(q.clone(), vec![r])];

        let profile = LeadProfile {
            campaign: Some("big-SUMMER-sale".to_string()),
            ..Default::default()
        };

        assert!(matches!(select_queue(&queues, &profile), QueueMatch::Rule { queue_id, .. } if queue_id == q.id));
    }

    #[test]
    fn test_higher_priority_rule_evaluated_first() {
        let q = queue("Sources");
        let low = rule(q.id, "source", vec!["website".to_string()], 1);
        let high = rule(q.id, "city", vec!["Porto".to_string()], 10);
        let high_id = high.id;

        let queues = vec![(q, vec![low, high])];
        let profile = LeadProfile {
            source: Some("website".to_string()),
            city: Some("Porto".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            select_queue(&queues, &profile),
            QueueMatch::Rule { rule_id, .. } if rule_id == high_id
        ));
    }

    #[test]
    fn test_inactive_queue_is_skipped() {
        let mut q = queue("Disabled");
        q.is_active = false;
        let r = rule(q.id, "source", vec!["website".to_string()], 1);

        let queues = vec![(q, vec![r])];
        let profile = LeadProfile {
            source: Some("website".to_string()),
            ..Default::default()
        };

        assert_eq!(select_queue(&queues, &profile), QueueMatch::None);
    }

    #[test]
    fn test_unknown_match_type_never_matches() {
        let q = queue("Odd");
        let r = rule(q.id, "zodiac_sign", vec!["leo".to_string()], 1);
        let queues = vec![(q, vec![r])];

        assert_eq!(select_queue(&queues, &LeadProfile::default()), QueueMatch::None);
    }
}
