use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::agent::events::{ObservabilityHooks, RunEvent};
use crate::llm::LlmProvider;
use crate::llm::retry::{RetryConfig, RetryingProvider};
use crate::llm::types::{CompletionRequest, Message};
use crate::plan::{Plan, TaskOutcome};
use crate::util::{contains_token, extract_json};

/// The synthesized answer for a run. Produced even when workers failed or the
/// synthesis oracle was unreachable; degradation is expressed through
/// `grounding_disclaimer`, never through an error.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub final_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub grounding_disclaimer: Option<String>,
}

/// Fraction-weighted mean of succeeded task confidences.
///
/// Tasks that failed or were skipped contribute zero, so a run where one of
/// three tasks succeeded at 0.9 scores 0.3.
pub fn confidence_score(plan: &Plan, outcomes: &BTreeMap<String, TaskOutcome>) -> f64 {
    let confidences: Vec<f64> = outcomes
        .values()
        .filter_map(|o| o.as_success())
        .map(|r| r.confidence)
        .collect();
    if confidences.is_empty() || plan.is_empty() {
        return 0.0;
    }
    let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    mean * (confidences.len() as f64 / plan.len() as f64)
}

/// Task ids whose results back the synthesis, in id order.
pub fn evidence_task_ids(outcomes: &BTreeMap<String, TaskOutcome>) -> Vec<String> {
    outcomes
        .iter()
        .filter(|(_, o)| o.is_succeeded())
        .map(|(id, _)| id.clone())
        .collect()
}

/// Combines worker results into final insights and recommendations, with a
/// grounding check that every insight cites at least one succeeded task and
/// that nothing attributes claims to tasks that failed or were skipped.
pub struct Aggregator<P> {
    provider: Arc<P>,
    retry: RetryConfig,
    max_tokens: u32,
}

impl<P: LlmProvider + 'static> Aggregator<P> {
    pub fn new(provider: Arc<P>, retry: RetryConfig, max_tokens: u32) -> Self {
        Self {
            provider,
            retry,
            max_tokens,
        }
    }

    pub async fn synthesize(
        &self,
        request: &str,
        plan: &Plan,
        outcomes: &BTreeMap<String, TaskOutcome>,
        run_id: &str,
        hooks: Arc<dyn ObservabilityHooks>,
    ) -> Synthesis {
        let evidence = evidence_task_ids(outcomes);
        hooks.on_event(&RunEvent::SynthesisStarted {
            run_id: run_id.to_string(),
            evidence_task_ids: evidence.clone(),
        });

        // Nothing succeeded: there is no evidence to synthesize from, and
        // calling the oracle would only invite fabrication.
        if evidence.is_empty() {
            let synthesis = Synthesis {
                final_insights: vec![],
                recommendations: vec![],
                grounding_disclaimer: Some(
                    "No tasks completed successfully; no grounded insights are available.".into(),
                ),
            };
            hooks.on_event(&RunEvent::SynthesisCompleted {
                run_id: run_id.to_string(),
                insight_count: 0,
                grounded: false,
            });
            return synthesis;
        }

        let retry_hooks = hooks.clone();
        let retry_run_id = run_id.to_string();
        let provider = RetryingProvider::new(self.provider.clone(), self.retry.clone())
            .with_on_retry(Arc::new(move |attempt, max_retries, delay_ms, class| {
                retry_hooks.on_event(&RunEvent::OracleRetry {
                    run_id: retry_run_id.clone(),
                    attempt,
                    max_retries,
                    delay_ms,
                    error_class: class.to_string(),
                });
            }));

        // Plan tasks without a successful result must never be cited.
        let unavailable: Vec<String> = plan
            .tasks
            .iter()
            .map(|t| t.id.clone())
            .filter(|id| !evidence.contains(id))
            .collect();

        let user_message = build_evidence_message(request, plan, outcomes);
        let mut disclaimer = None;
        let mut draft: Option<SynthesisDraft> = None;

        // One regeneration attempt when the first draft is malformed or cites
        // no evidence; after that, degrade rather than loop.
        for attempt in 0..2 {
            let mut messages = vec![Message::user(user_message.clone())];
            if attempt > 0 {
                messages.push(Message::assistant("(previous draft discarded)"));
                messages.push(Message::user(
                    "Your previous draft was rejected: every insight must cite at least \
                     one task id from the evidence (for example t1) verbatim, and no \
                     insight or recommendation may reference a task that failed or was \
                     skipped. Regenerate accordingly.",
                ));
            }
            let response = provider
                .complete(CompletionRequest {
                    system: SYNTHESIS_PROMPT.to_string(),
                    messages,
                    tools: vec![],
                    max_tokens: self.max_tokens,
                })
                .await;

            let text = match response {
                Ok(response) => response.text(),
                Err(e) => {
                    warn!(error = %e, "synthesis oracle unavailable, degrading to raw results");
                    disclaimer = Some(
                        "Synthesis was unavailable; insights below are unprocessed worker \
                         results."
                            .to_string(),
                    );
                    break;
                }
            };

            match parse_synthesis(&text) {
                Some(parsed) if is_grounded(&parsed, &evidence, &unavailable) => {
                    draft = Some(parsed);
                    break;
                }
                Some(parsed) if attempt == 1 => {
                    disclaimer = Some(
                        "Some insights or recommendations could not be grounded in \
                         completed task results."
                            .to_string(),
                    );
                    draft = Some(parsed);
                }
                Some(_) => {
                    warn!("synthesis draft failed grounding check, regenerating once");
                }
                None if attempt == 1 => {
                    disclaimer = Some(
                        "Synthesis output was malformed; insights below are unprocessed \
                         worker results."
                            .to_string(),
                    );
                }
                None => {
                    warn!("synthesis draft was not valid JSON, regenerating once");
                }
            }
        }

        let grounded = disclaimer.is_none();
        let synthesis = match draft {
            Some(draft) => Synthesis {
                final_insights: draft.insights,
                recommendations: draft.recommendations,
                grounding_disclaimer: disclaimer,
            },
            // Fall back to the raw succeeded outputs, attributed by task id.
            None => Synthesis {
                final_insights: outcomes
                    .values()
                    .filter_map(|o| o.as_success())
                    .map(|r| format!("[{}] {}", r.task_id, r.output.text))
                    .collect(),
                recommendations: vec![],
                grounding_disclaimer: disclaimer,
            },
        };

        hooks.on_event(&RunEvent::SynthesisCompleted {
            run_id: run_id.to_string(),
            insight_count: synthesis.final_insights.len(),
            grounded,
        });
        synthesis
    }
}

const SYNTHESIS_PROMPT: &str = "\
You are the aggregator for a data analysis team. You receive the user's \
request and the evidence produced by worker tasks. Combine the evidence into \
final insights and recommendations.

Respond with ONLY a JSON object in this exact shape:
{\"insights\": [\"...\"], \"recommendations\": [\"...\"]}

Rules:
- Every insight must cite at least one task id from the evidence (for \
example t1) verbatim.
- Draw only on the evidence. Do not invent findings for tasks that failed \
or were skipped; mention missing coverage instead, without citing their \
task ids.";

fn build_evidence_message(
    request: &str,
    plan: &Plan,
    outcomes: &BTreeMap<String, TaskOutcome>,
) -> String {
    let mut out = format!("User request: {request}\n\nTask evidence:\n");
    for task in &plan.tasks {
        let Some(outcome) = outcomes.get(&task.id) else {
            continue;
        };
        match outcome {
            TaskOutcome::Succeeded(result) => {
                out.push_str(&format!(
                    "\n[{} ({}), confidence {:.2}] {}\n{}\n",
                    result.task_id, result.worker, result.confidence, task.description,
                    result.output.text
                ));
                if let Some(payload) = &result.output.payload {
                    out.push_str(&format!("payload: {payload}\n"));
                }
            }
            TaskOutcome::Failed(failure) => {
                out.push_str(&format!(
                    "\n[{} FAILED] {} ({:?}: {})\n",
                    failure.task_id, task.description, failure.kind, failure.message
                ));
            }
            TaskOutcome::Skipped { reason } => {
                out.push_str(&format!(
                    "\n[{} SKIPPED] {} ({reason})\n",
                    task.id, task.description
                ));
            }
        }
    }
    out
}

#[derive(Deserialize)]
struct SynthesisDraft {
    insights: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

fn parse_synthesis(text: &str) -> Option<SynthesisDraft> {
    let json = extract_json(text)?;
    serde_json::from_str(json).ok()
}

/// Every insight must cite at least one succeeded task id, and neither
/// insights nor recommendations may cite a task that failed or was skipped.
/// Ids match as standalone tokens, so `t2` does not match inside `t21`.
fn is_grounded(draft: &SynthesisDraft, evidence: &[String], unavailable: &[String]) -> bool {
    let cites = |text: &str, ids: &[String]| ids.iter().any(|id| contains_token(text, id));
    !draft.insights.is_empty()
        && draft.insights.iter().all(|i| cites(i, evidence))
        && !draft.insights.iter().any(|i| cites(i, unavailable))
        && !draft.recommendations.iter().any(|r| cites(r, unavailable))
}
