//! Evaluator provider and built-in condition evaluators.
//!
//! An evaluator is the pre-compiled, side-effect-free condition/action
//! logic of a rule. Evaluation is deterministic and pure: identical
//! `(variables, snapshots, params)` always yield the identical outcome,
//! which is what makes crash recovery replay-safe.
//!
//! Built-ins: `threshold`, `delta`, `absence`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use faultline_timeseries::PointSnapshot;

/// Everything an evaluator may look at for one step.
pub struct EvalInput<'a> {
    /// Opaque working set carried between steps.
    pub variables: &'a HashMap<String, Value>,
    /// Point alias → aggregate snapshot, as of the trigger time.
    pub snapshots: &'a HashMap<String, PointSnapshot>,
    /// Template parameter block.
    pub params: &'a Value,
    /// Trigger timestamp — NOT wall clock, so replay is deterministic.
    pub as_of: DateTime<Utc>,
}

/// A remediation the evaluator wants issued while satisfied.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Point alias resolved to a concrete point via the instance
    /// bindings.
    pub target_alias: String,
    pub value: f64,
}

/// Result of one evaluation step.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub satisfied: bool,
    /// Replacement working set for the next step.
    pub variables: HashMap<String, Value>,
    /// Human-readable summary for the insight.
    pub text: String,
    pub priority: i32,
    /// Supporting values recorded on the insight.
    pub evidence: Value,
    pub command: Option<CommandRequest>,
}

/// Side-effect-free rule condition/action logic.
pub trait Evaluator: Send + Sync {
    /// Validate the parameter block at template-validation time.
    fn check_params(&self, params: &Value) -> Result<(), String>;

    /// One pure evaluation step. Errors must leave no trace — the
    /// caller rolls variables back.
    fn evaluate(&self, input: &EvalInput) -> Result<EvalOutcome, String>;
}

/// Registry resolving a template's `expression_ref` to its evaluator.
pub struct EvaluatorProvider {
    evaluators: HashMap<String, Arc<dyn Evaluator>>,
}

impl EvaluatorProvider {
    pub fn new() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// Provider with the built-in evaluator set registered.
    pub fn with_builtins() -> Self {
        let mut provider = Self::new();
        provider.register("threshold", Arc::new(ThresholdEvaluator));
        provider.register("delta", Arc::new(DeltaEvaluator));
        provider.register("absence", Arc::new(AbsenceEvaluator));
        provider
    }

    pub fn register(&mut self, expression_ref: &str, evaluator: Arc<dyn Evaluator>) {
        self.evaluators
            .insert(expression_ref.to_string(), evaluator);
    }

    pub fn resolve(&self, expression_ref: &str) -> Option<Arc<dyn Evaluator>> {
        self.evaluators.get(expression_ref).cloned()
    }
}

impl Default for EvaluatorProvider {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── Threshold ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CommandParams {
    target: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ThresholdParams {
    point: String,
    operator: ThresholdOperator,
    limit: f64,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    command: Option<CommandParams>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ThresholdOperator {
    fn holds(self, value: f64, limit: f64) -> bool {
        match self {
            ThresholdOperator::Gt => value > limit,
            ThresholdOperator::Gte => value >= limit,
            ThresholdOperator::Lt => value < limit,
            ThresholdOperator::Lte => value <= limit,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ThresholdOperator::Gt => ">",
            ThresholdOperator::Gte => ">=",
            ThresholdOperator::Lt => "<",
            ThresholdOperator::Lte => "<=",
        }
    }
}

/// Fires while a point's latest value violates a fixed limit.
pub struct ThresholdEvaluator;

impl Evaluator for ThresholdEvaluator {
    fn check_params(&self, params: &Value) -> Result<(), String> {
        serde_json::from_value::<ThresholdParams>(params.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn evaluate(&self, input: &EvalInput) -> Result<EvalOutcome, String> {
        let params: ThresholdParams =
            serde_json::from_value(input.params.clone()).map_err(|e| e.to_string())?;

        let snapshot = input
            .snapshots
            .get(&params.point)
            .ok_or_else(|| format!("missing snapshot for point '{}'", params.point))?;

        let value = snapshot.last.value;
        let satisfied = params.operator.holds(value, params.limit);

        let mut variables = input.variables.clone();
        variables.insert("last_value".to_string(), Value::from(value));

        let command = if satisfied {
            params.command.map(|c| CommandRequest {
                target_alias: c.target,
                value: c.value,
            })
        } else {
            None
        };

        Ok(EvalOutcome {
            satisfied,
            variables,
            text: format!(
                "{} = {} (limit {} {})",
                params.point,
                value,
                params.operator.symbol(),
                params.limit
            ),
            priority: params.priority.unwrap_or(3),
            evidence: serde_json::json!({
                "point": params.point,
                "value": value,
                "limit": params.limit,
                "observed_at": snapshot.last.timestamp,
            }),
            command,
        })
    }
}

// ── Delta ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeltaParams {
    point: String,
    /// Absolute change between consecutive samples that fires the rule.
    limit: f64,
    #[serde(default)]
    priority: Option<i32>,
}

/// Fires when a point jumps by more than `limit` between consecutive
/// samples.
pub struct DeltaEvaluator;

impl Evaluator for DeltaEvaluator {
    fn check_params(&self, params: &Value) -> Result<(), String> {
        serde_json::from_value::<DeltaParams>(params.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn evaluate(&self, input: &EvalInput) -> Result<EvalOutcome, String> {
        let params: DeltaParams =
            serde_json::from_value(input.params.clone()).map_err(|e| e.to_string())?;

        let snapshot = input
            .snapshots
            .get(&params.point)
            .ok_or_else(|| format!("missing snapshot for point '{}'", params.point))?;

        let delta = snapshot.last_delta().unwrap_or(0.0);
        let satisfied = delta.abs() > params.limit;

        let mut variables = input.variables.clone();
        variables.insert("last_delta".to_string(), Value::from(delta));

        Ok(EvalOutcome {
            satisfied,
            variables,
            text: format!("{} jumped by {:.2} (limit {})", params.point, delta, params.limit),
            priority: params.priority.unwrap_or(3),
            evidence: serde_json::json!({
                "point": params.point,
                "delta": delta,
                "limit": params.limit,
            }),
            command: None,
        })
    }
}

// ── Absence ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AbsenceParams {
    point: String,
    /// Seconds of silence after which the point is considered offline.
    max_gap_secs: i64,
    #[serde(default)]
    priority: Option<i32>,
}

/// Fires when a point has not reported within `max_gap_secs` of the
/// trigger time.
pub struct AbsenceEvaluator;

impl Evaluator for AbsenceEvaluator {
    fn check_params(&self, params: &Value) -> Result<(), String> {
        let p: AbsenceParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        if p.max_gap_secs <= 0 {
            return Err("max_gap_secs must be positive".to_string());
        }
        Ok(())
    }

    fn evaluate(&self, input: &EvalInput) -> Result<EvalOutcome, String> {
        let params: AbsenceParams =
            serde_json::from_value(input.params.clone()).map_err(|e| e.to_string())?;

        // Missing snapshot means the point never reported at all.
        let (satisfied, last_seen) = match input.snapshots.get(&params.point) {
            Some(snapshot) => {
                let gap = input.as_of - snapshot.last.timestamp;
                (gap > Duration::seconds(params.max_gap_secs), Some(snapshot.last.timestamp))
            }
            None => (true, None),
        };

        Ok(EvalOutcome {
            satisfied,
            variables: input.variables.clone(),
            text: match last_seen {
                Some(ts) => format!("{} silent since {}", params.point, ts),
                None => format!("{} has never reported", params.point),
            },
            priority: params.priority.unwrap_or(2),
            evidence: serde_json::json!({
                "point": params.point,
                "last_seen": last_seen,
                "max_gap_secs": params.max_gap_secs,
            }),
            command: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use faultline_timeseries::TimedValue;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn snapshot(alias: &str, last: f64, previous: Option<f64>, at: i64) -> (String, PointSnapshot) {
        (
            alias.to_string(),
            PointSnapshot {
                point_id: format!("{}-id", alias),
                as_of: ts(at),
                last: TimedValue {
                    timestamp: ts(at),
                    value: last,
                },
                previous: previous.map(|v| TimedValue {
                    timestamp: ts(at - 60),
                    value: v,
                }),
                count: if previous.is_some() { 2 } else { 1 },
                sum: last + previous.unwrap_or(0.0),
                min: last.min(previous.unwrap_or(last)),
                max: last.max(previous.unwrap_or(last)),
            },
        )
    }

    fn input<'a>(
        variables: &'a HashMap<String, Value>,
        snapshots: &'a HashMap<String, PointSnapshot>,
        params: &'a Value,
        as_of: DateTime<Utc>,
    ) -> EvalInput<'a> {
        EvalInput {
            variables,
            snapshots,
            params,
            as_of,
        }
    }

    #[test]
    fn test_threshold_fires_above_limit() {
        let vars = HashMap::new();
        let snaps: HashMap<_, _> = [snapshot("temp", 90.0, None, 60)].into_iter().collect();
        let params = serde_json::json!({"point": "temp", "operator": "gt", "limit": 80.0});

        let outcome = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(60)))
            .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.variables["last_value"], Value::from(90.0));

        let snaps: HashMap<_, _> = [snapshot("temp", 60.0, None, 120)].into_iter().collect();
        let outcome = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(120)))
            .unwrap();
        assert!(!outcome.satisfied);
    }

    #[test]
    fn test_threshold_is_deterministic() {
        let vars = HashMap::new();
        let snaps: HashMap<_, _> = [snapshot("temp", 85.0, Some(70.0), 60)].into_iter().collect();
        let params = serde_json::json!({"point": "temp", "operator": "gt", "limit": 80.0});

        let a = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(60)))
            .unwrap();
        let b = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(60)))
            .unwrap();
        assert_eq!(a.satisfied, b.satisfied);
        assert_eq!(a.variables, b.variables);
        assert_eq!(a.evidence, b.evidence);
    }

    #[test]
    fn test_threshold_emits_command_only_when_satisfied() {
        let vars = HashMap::new();
        let params = serde_json::json!({
            "point": "temp", "operator": "gt", "limit": 80.0,
            "command": {"target": "setpoint", "value": 72.0}
        });

        let snaps: HashMap<_, _> = [snapshot("temp", 90.0, None, 60)].into_iter().collect();
        let outcome = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(60)))
            .unwrap();
        assert_eq!(
            outcome.command,
            Some(CommandRequest {
                target_alias: "setpoint".to_string(),
                value: 72.0
            })
        );

        let snaps: HashMap<_, _> = [snapshot("temp", 60.0, None, 120)].into_iter().collect();
        let outcome = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(120)))
            .unwrap();
        assert!(outcome.command.is_none());
    }

    #[test]
    fn test_threshold_missing_snapshot_is_error() {
        let vars = HashMap::new();
        let snaps = HashMap::new();
        let params = serde_json::json!({"point": "temp", "operator": "gt", "limit": 80.0});
        let err = ThresholdEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(0)))
            .unwrap_err();
        assert!(err.contains("missing snapshot"));
    }

    #[test]
    fn test_delta_fires_on_jump() {
        let vars = HashMap::new();
        let snaps: HashMap<_, _> = [snapshot("pressure", 110.0, Some(100.0), 60)]
            .into_iter()
            .collect();
        let params = serde_json::json!({"point": "pressure", "limit": 5.0});
        let outcome = DeltaEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(60)))
            .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.variables["last_delta"], Value::from(10.0));
    }

    #[test]
    fn test_absence_fires_after_gap() {
        let vars = HashMap::new();
        let snaps: HashMap<_, _> = [snapshot("temp", 70.0, None, 0)].into_iter().collect();
        let params = serde_json::json!({"point": "temp", "max_gap_secs": 300});

        let outcome = AbsenceEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(100)))
            .unwrap();
        assert!(!outcome.satisfied);

        let outcome = AbsenceEvaluator
            .evaluate(&input(&vars, &snaps, &params, ts(600)))
            .unwrap();
        assert!(outcome.satisfied);

        // A point that never reported counts as absent.
        let empty = HashMap::new();
        let outcome = AbsenceEvaluator
            .evaluate(&input(&vars, &empty, &params, ts(600)))
            .unwrap();
        assert!(outcome.satisfied);
    }

    #[test]
    fn test_provider_resolution() {
        let provider = EvaluatorProvider::with_builtins();
        assert!(provider.resolve("threshold").is_some());
        assert!(provider.resolve("delta").is_some());
        assert!(provider.resolve("absence").is_some());
        assert!(provider.resolve("unknown").is_none());
    }
}
