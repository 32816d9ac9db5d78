//! Scalar SQL functions registered on every connection.

use crate::json::contains;
use crate::vector::{decode_vector, text_rank, DistanceMetric};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::Connection;
use serde_json::Value;

fn user_error(message: String) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(message.into())
}

fn parse_json(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    match ctx.get::<Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| user_error(format!("invalid JSON argument: {}", e))),
        None => Ok(None),
    }
}

fn distance(ctx: &Context<'_>, metric: DistanceMetric) -> rusqlite::Result<Option<f64>> {
    let (Some(a), Some(b)) = (ctx.get::<Option<Vec<u8>>>(0)?, ctx.get::<Option<Vec<u8>>>(1)?) else {
        return Ok(None);
    };
    let a = decode_vector(&a).map_err(|e| user_error(e.to_string()))?;
    let b = decode_vector(&b).map_err(|e| user_error(e.to_string()))?;
    if a.len() != b.len() {
        return Err(user_error(format!(
            "vector dimensions differ: {} and {}",
            a.len(),
            b.len()
        )));
    }
    Ok(Some(metric.distance(&a, &b)))
}

/// Register `json_contains`, the vector distance functions and `text_rank`.
pub(crate) fn register(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("json_contains", 2, flags, |ctx| {
        let (Some(target), Some(candidate)) = (parse_json(ctx, 0)?, parse_json(ctx, 1)?) else {
            return Ok(false);
        };
        Ok(contains(&target, &candidate))
    })?;

    for metric in [
        DistanceMetric::Cosine,
        DistanceMetric::L2,
        DistanceMetric::InnerProduct,
    ] {
        conn.create_scalar_function(metric.sql_function(), 2, flags, move |ctx| {
            distance(ctx, metric)
        })?;
    }

    conn.create_scalar_function("text_rank", 2, flags, |ctx| {
        let text = ctx.get::<Option<String>>(0)?.unwrap_or_default();
        let query = ctx.get::<Option<String>>(1)?.unwrap_or_default();
        Ok(text_rank(&text, &query))
    })?;

    Ok(())
}
