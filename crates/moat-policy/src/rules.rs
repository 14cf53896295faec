// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fixed rule table.
//!
//! Evaluation is pure: given the bundle, manifest, request, a budget
//! snapshot, and the current instant, the outcome is fully determined.
//! Rules run in priority order and the first failure short-circuits.

use chrono::{DateTime, Utc};
use moat_core::{
    ApprovalState, BudgetSnapshot, CapabilityManifest, ExecuteRequest, PolicyBundle, RuleHit,
};

/// Everything a single evaluation may look at.
#[derive(Debug)]
pub struct EvaluationInput<'a> {
    /// The tenant's bundle, if one exists.
    pub bundle: Option<&'a PolicyBundle>,
    /// The resolved manifest.
    pub manifest: &'a CapabilityManifest,
    /// The inbound request.
    pub request: &'a ExecuteRequest,
    /// Counter values at evaluation time (pre-increment).
    pub budget: &'a BudgetSnapshot,
    /// The evaluation instant (drives approval expiry).
    pub now: DateTime<Utc>,
}

/// Outcome of running the rule table: the first failing rule or
/// `PolicyAllowed`, plus soft-limit warnings accumulated along the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    /// First failing rule, or `PolicyAllowed`.
    pub hit: RuleHit,
    /// Soft-limit annotations (populated when `hard_limit` is false).
    pub warnings: Vec<String>,
}

impl RuleOutcome {
    /// Whether the outcome permits execution.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.hit == RuleHit::PolicyAllowed
    }
}

/// Run the rule table in priority order.
#[must_use]
pub fn run(input: &EvaluationInput<'_>) -> RuleOutcome {
    let mut warnings = Vec::new();

    // 1. no_policy_bundle — default-deny without an explicit grant.
    let Some(bundle) = input.bundle else {
        return RuleOutcome {
            hit: RuleHit::NoPolicyBundle,
            warnings,
        };
    };

    // 2. scope_granted — every manifest scope must be granted.
    for scope in &input.manifest.scopes {
        if !bundle.granted_scopes.iter().any(|g| g == scope) {
            return RuleOutcome {
                hit: RuleHit::ScopeNotGranted,
                warnings,
            };
        }
    }

    // 3. scope_not_denied — deny beats grant.
    for scope in &input.manifest.scopes {
        if bundle.denied_scopes.iter().any(|d| d == scope) {
            return RuleOutcome {
                hit: RuleHit::ScopeExplicitlyDenied,
                warnings,
            };
        }
    }

    // 4–7. budget rules: nullable limit means unlimited (rule skipped);
    // hard_limit=false downgrades a violation to a warning annotation.
    let budget_checks: [(Option<bool>, RuleHit, String); 4] = [
        (
            bundle
                .daily_calls_limit
                .map(|limit| input.budget.daily_calls_used >= limit),
            RuleHit::BudgetDailyCallsExceeded,
            format!(
                "daily call limit reached ({}/{})",
                input.budget.daily_calls_used,
                bundle.daily_calls_limit.unwrap_or_default()
            ),
        ),
        (
            bundle
                .monthly_calls_limit
                .map(|limit| input.budget.monthly_calls_used >= limit),
            RuleHit::BudgetMonthlyCallsExceeded,
            format!(
                "monthly call limit reached ({}/{})",
                input.budget.monthly_calls_used,
                bundle.monthly_calls_limit.unwrap_or_default()
            ),
        ),
        (
            bundle
                .daily_cost_usd_limit
                .map(|limit| input.budget.daily_cost_usd_used >= limit),
            RuleHit::BudgetDailyCostExceeded,
            format!(
                "daily cost limit reached (${:.2}/${:.2})",
                input.budget.daily_cost_usd_used,
                bundle.daily_cost_usd_limit.unwrap_or_default()
            ),
        ),
        (
            bundle
                .monthly_cost_usd_limit
                .map(|limit| input.budget.monthly_cost_usd_used >= limit),
            RuleHit::BudgetMonthlyCostExceeded,
            format!(
                "monthly cost limit reached (${:.2}/${:.2})",
                input.budget.monthly_cost_usd_used,
                bundle.monthly_cost_usd_limit.unwrap_or_default()
            ),
        ),
    ];
    for (violated, hit, annotation) in budget_checks {
        if violated == Some(true) {
            if bundle.hard_limit {
                return RuleOutcome { hit, warnings };
            }
            warnings.push(annotation);
        }
    }

    // 8. domain_allowlist_nonempty — a capability without a vetted outbound
    // surface is not executable.
    if input.manifest.domain_allowlist.is_empty() {
        return RuleOutcome {
            hit: RuleHit::DomainNotAllowlisted,
            warnings,
        };
    }

    // 9. approval gate for high-risk classes.
    if bundle
        .approval_required_risk_classes
        .contains(&input.manifest.risk_class)
    {
        match &input.request.approval_token {
            None => {
                return RuleOutcome {
                    hit: RuleHit::ApprovalRequired,
                    warnings,
                };
            }
            Some(token) => match token.state {
                ApprovalState::Pending => {
                    return RuleOutcome {
                        hit: RuleHit::ApprovalPending,
                        warnings,
                    };
                }
                ApprovalState::Denied => {
                    return RuleOutcome {
                        hit: RuleHit::ApprovalDenied,
                        warnings,
                    };
                }
                ApprovalState::Granted => {
                    if token.expires_at <= input.now {
                        return RuleOutcome {
                            hit: RuleHit::ApprovalExpired,
                            warnings,
                        };
                    }
                }
            },
        }
    }

    RuleOutcome {
        hit: RuleHit::PolicyAllowed,
        warnings,
    }
}
