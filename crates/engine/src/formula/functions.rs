// Built-in spreadsheet functions.
//
// The dispatch table below is closed: a name either matches an arm here or
// evaluation fails with UnknownFunction. Aggregates flatten range arguments
// into their member values; IF evaluates only the taken branch.

use crate::cell::Value;

use super::eval::{eval_expr, EvalError, ValueLookup};
use super::parser::Expr;
use super::refs;

/// Check if a function name is a known built-in.
/// This is the single source of truth for the supported library.
/// Names must be uppercase (as produced by the parser).
pub fn is_known_function(name: &str) -> bool {
    matches!(
        name,
        // Aggregates
        "SUM" | "AVERAGE" | "MAX" | "MIN" | "COUNT" |
        // Logic
        "IF" |
        // Math
        "ROUND" | "ABS" | "SQRT" | "POWER" | "EXP" | "LN" | "LOG" |
        // Financial
        "NPV" | "IRR" | "PMT" | "PV" | "FV"
    )
}

pub(crate) fn dispatch<L: ValueLookup>(
    name: &str,
    args: &[Expr],
    lookup: &L,
) -> Result<Value, EvalError> {
    match name {
        "IF" => eval_if(args, lookup),

        "SUM" => {
            let values = numeric_flat("SUM", args, lookup)?;
            Ok(Value::Number(values.iter().sum()))
        }
        "AVERAGE" => {
            let values = numeric_flat("AVERAGE", args, lookup)?;
            if values.is_empty() {
                return Ok(Value::Number(0.0));
            }
            Ok(Value::Number(values.iter().sum::<f64>() / values.len() as f64))
        }
        "MAX" => {
            let values = numeric_flat("MAX", args, lookup)?;
            if values.is_empty() {
                return Ok(Value::Number(0.0));
            }
            Ok(Value::Number(
                values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ))
        }
        "MIN" => {
            let values = numeric_flat("MIN", args, lookup)?;
            if values.is_empty() {
                return Ok(Value::Number(0.0));
            }
            Ok(Value::Number(
                values.iter().copied().fold(f64::INFINITY, f64::min),
            ))
        }
        "COUNT" => {
            let values = flatten(args, lookup)?;
            if values.is_empty() {
                log_empty_input("COUNT");
            }
            let count = values.iter().filter(|v| v.is_numeric()).count();
            Ok(Value::Number(count as f64))
        }

        "ROUND" => {
            expect_args("ROUND", args, 1, 2, "1 or 2")?;
            let value = scalar_arg(args, 0, lookup)?;
            let digits = if args.len() == 2 {
                scalar_arg(args, 1, lookup)? as i32
            } else {
                0
            };
            let factor = 10_f64.powi(digits);
            Ok(Value::Number((value * factor).round() / factor))
        }
        "ABS" => {
            expect_args("ABS", args, 1, 1, "exactly 1")?;
            Ok(Value::Number(scalar_arg(args, 0, lookup)?.abs()))
        }
        "SQRT" => {
            expect_args("SQRT", args, 1, 1, "exactly 1")?;
            let n = scalar_arg(args, 0, lookup)?;
            if n < 0.0 {
                return Err(EvalError::MathDomain("SQRT of a negative number".to_string()));
            }
            Ok(Value::Number(n.sqrt()))
        }
        "POWER" => {
            expect_args("POWER", args, 2, 2, "exactly 2")?;
            let base = scalar_arg(args, 0, lookup)?;
            let exponent = scalar_arg(args, 1, lookup)?;
            let result = base.powf(exponent);
            if !result.is_finite() {
                return Err(EvalError::MathDomain("POWER result out of range".to_string()));
            }
            Ok(Value::Number(result))
        }
        "EXP" => {
            expect_args("EXP", args, 1, 1, "exactly 1")?;
            let result = scalar_arg(args, 0, lookup)?.exp();
            if !result.is_finite() {
                return Err(EvalError::MathDomain("EXP result out of range".to_string()));
            }
            Ok(Value::Number(result))
        }
        "LN" => {
            expect_args("LN", args, 1, 1, "exactly 1")?;
            let n = scalar_arg(args, 0, lookup)?;
            if n <= 0.0 {
                return Err(EvalError::MathDomain("LN of non-positive input".to_string()));
            }
            Ok(Value::Number(n.ln()))
        }
        "LOG" => {
            expect_args("LOG", args, 1, 2, "1 or 2")?;
            let n = scalar_arg(args, 0, lookup)?;
            let base = if args.len() == 2 {
                scalar_arg(args, 1, lookup)?
            } else {
                10.0
            };
            if n <= 0.0 {
                return Err(EvalError::MathDomain("LOG of non-positive input".to_string()));
            }
            if base <= 0.0 || base == 1.0 {
                return Err(EvalError::MathDomain(format!("invalid LOG base {}", base)));
            }
            Ok(Value::Number(n.log(base)))
        }

        "NPV" => eval_npv(args, lookup),
        "IRR" => eval_irr(args, lookup),
        "PMT" => {
            expect_args("PMT", args, 3, 4, "3 or 4")?;
            let rate = scalar_arg(args, 0, lookup)?;
            let nper = scalar_arg(args, 1, lookup)?;
            let pv = scalar_arg(args, 2, lookup)?;
            let fv = opt_scalar_arg(args, 3, lookup, 0.0)?;
            if nper <= 0.0 {
                return Err(EvalError::MathDomain(
                    "PMT requires a positive number of periods".to_string(),
                ));
            }
            Ok(Value::Number(compute_pmt(rate, nper, pv, fv)))
        }
        "PV" => {
            expect_args("PV", args, 3, 4, "3 or 4")?;
            let rate = scalar_arg(args, 0, lookup)?;
            let nper = scalar_arg(args, 1, lookup)?;
            let pmt = scalar_arg(args, 2, lookup)?;
            let fv = opt_scalar_arg(args, 3, lookup, 0.0)?;
            if rate == 0.0 {
                return Ok(Value::Number(-(fv + pmt * nper)));
            }
            let pow = (1.0 + rate).powf(nper);
            Ok(Value::Number(-(fv + pmt * (pow - 1.0) / rate) / pow))
        }
        "FV" => {
            expect_args("FV", args, 3, 4, "3 or 4")?;
            let rate = scalar_arg(args, 0, lookup)?;
            let nper = scalar_arg(args, 1, lookup)?;
            let pmt = scalar_arg(args, 2, lookup)?;
            let pv = opt_scalar_arg(args, 3, lookup, 0.0)?;
            if rate == 0.0 {
                return Ok(Value::Number(-(pv + pmt * nper)));
            }
            let pow = (1.0 + rate).powf(nper);
            Ok(Value::Number(-(pv * pow + pmt * (pow - 1.0) / rate)))
        }

        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn log_empty_input(name: &str) {
    log::debug!("{} evaluated over empty input; returning 0", name);
}

/// Evaluate arguments into a flat value list. Ranges expand to their member
/// cells' values; every member must be bound.
fn flatten<L: ValueLookup>(args: &[Expr], lookup: &L) -> Result<Vec<Value>, EvalError> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Expr::Range(range) => {
                for reference in refs::expand_range(range)? {
                    let value = lookup
                        .lookup(&reference)
                        .ok_or(EvalError::UnknownReference(reference))?;
                    out.push(value);
                }
            }
            other => out.push(eval_expr(other, lookup)?),
        }
    }
    Ok(out)
}

/// Flatten and coerce every entry to a number, logging empty input.
fn numeric_flat<L: ValueLookup>(
    name: &str,
    args: &[Expr],
    lookup: &L,
) -> Result<Vec<f64>, EvalError> {
    let values = flatten(args, lookup)?;
    if values.is_empty() {
        log_empty_input(name);
    }
    values.iter().map(|v| v.to_number()).collect()
}

fn expect_args(
    name: &str,
    args: &[Expr],
    min: usize,
    max: usize,
    expected: &'static str,
) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        return Err(EvalError::ArgCount {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn scalar_arg<L: ValueLookup>(args: &[Expr], idx: usize, lookup: &L) -> Result<f64, EvalError> {
    eval_expr(&args[idx], lookup)?.to_number()
}

fn opt_scalar_arg<L: ValueLookup>(
    args: &[Expr],
    idx: usize,
    lookup: &L,
    default: f64,
) -> Result<f64, EvalError> {
    if idx < args.len() {
        scalar_arg(args, idx, lookup)
    } else {
        Ok(default)
    }
}

fn eval_if<L: ValueLookup>(args: &[Expr], lookup: &L) -> Result<Value, EvalError> {
    expect_args("IF", args, 2, 3, "2 or 3")?;
    let condition = eval_expr(&args[0], lookup)?.to_bool()?;
    if condition {
        eval_expr(&args[1], lookup)
    } else if args.len() == 3 {
        eval_expr(&args[2], lookup)
    } else {
        Ok(Value::Number(0.0))
    }
}

// =============================================================================
// Financial functions
// =============================================================================

/// NPV(rate, *cash_flows): flow 0 is undiscounted (period 0).
fn eval_npv<L: ValueLookup>(args: &[Expr], lookup: &L) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::ArgCount {
            name: "NPV".to_string(),
            expected: "at least 1",
            got: 0,
        });
    }
    let rate = scalar_arg(args, 0, lookup)?;
    let flows = numeric_flat("NPV", &args[1..], lookup)?;
    if flows.len() > 1 && 1.0 + rate == 0.0 {
        return Err(EvalError::DivisionByZero);
    }
    Ok(Value::Number(npv_at(rate, &flows)))
}

fn npv_at(rate: f64, flows: &[f64]) -> f64 {
    flows
        .iter()
        .enumerate()
        .map(|(i, flow)| flow / (1.0 + rate).powi(i as i32))
        .sum()
}

/// IRR(values, [guess]): Newton iteration with a bisection fallback.
fn eval_irr<L: ValueLookup>(args: &[Expr], lookup: &L) -> Result<Value, EvalError> {
    expect_args("IRR", args, 1, 2, "1 or 2")?;
    let flows = numeric_flat("IRR", &args[..1], lookup)?;
    let guess = opt_scalar_arg(args, 1, lookup, 0.1)?;

    let has_positive = flows.iter().any(|f| *f > 0.0);
    let has_negative = flows.iter().any(|f| *f < 0.0);
    if !has_positive || !has_negative {
        return Err(EvalError::MathDomain(
            "IRR requires at least one positive and one negative cash flow".to_string(),
        ));
    }

    const TOLERANCE: f64 = 1e-7;

    // Newton's method on the NPV polynomial.
    let mut rate = guess.max(-0.999);
    for _ in 0..100 {
        let value = npv_at(rate, &flows);
        if value.abs() < TOLERANCE {
            return Ok(Value::Number(rate));
        }
        let derivative: f64 = flows
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, flow)| -(i as f64) * flow / (1.0 + rate).powi(i as i32 + 1))
            .sum();
        if derivative.abs() < 1e-12 {
            break;
        }
        let next = rate - value / derivative;
        if !next.is_finite() || next <= -1.0 {
            break;
        }
        rate = next;
    }

    // Bisection fallback: scan for a sign change, then narrow.
    const SCAN_LO: f64 = -0.9999;
    const SCAN_HI: f64 = 10.0;
    const SCAN_STEPS: usize = 1000;
    let step = (SCAN_HI - SCAN_LO) / SCAN_STEPS as f64;

    let mut lo_rate = SCAN_LO;
    let mut lo_value = npv_at(lo_rate, &flows);
    let mut bracket = None;
    for i in 1..=SCAN_STEPS {
        let hi_rate = SCAN_LO + i as f64 * step;
        let hi_value = npv_at(hi_rate, &flows);
        if lo_value.abs() < TOLERANCE {
            return Ok(Value::Number(lo_rate));
        }
        if lo_value.signum() != hi_value.signum() {
            bracket = Some((lo_rate, lo_value, hi_rate));
            break;
        }
        lo_rate = hi_rate;
        lo_value = hi_value;
    }
    let Some((mut lo_rate, mut lo_value, mut hi_rate)) = bracket else {
        return Err(EvalError::MathDomain("IRR did not converge".to_string()));
    };
    for _ in 0..200 {
        let mid = (lo_rate + hi_rate) / 2.0;
        let value = npv_at(mid, &flows);
        if value.abs() < TOLERANCE {
            return Ok(Value::Number(mid));
        }
        if value.signum() == lo_value.signum() {
            lo_rate = mid;
            lo_value = value;
        } else {
            hi_rate = mid;
        }
    }
    Err(EvalError::MathDomain("IRR did not converge".to_string()))
}

/// Constant-payment annuity formula.
fn compute_pmt(rate: f64, nper: f64, pv: f64, fv: f64) -> f64 {
    if rate == 0.0 {
        -(pv + fv) / nper
    } else {
        let pow = (1.0 + rate).powf(nper);
        -(rate * (pv * pow + fv)) / (pow - 1.0)
    }
}
