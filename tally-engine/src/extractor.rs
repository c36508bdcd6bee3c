//! Stage extraction
//!
//! Pulls contributor, time range and raw points for one stage out of a work
//! item. Any missing or mistyped required field yields
//! [`EngineError::MissingField`], which the caller logs before moving on to
//! the next stage.

use crate::error::{EngineError, EngineResult};
use crate::models::{LogicalField, Stage, StageFacts, WorkItem};
use crate::store::FieldValue;
use chrono::{DateTime, Utc};
use tally_common::config::ZeroPointsPolicy;
use tracing::warn;

pub fn extract(
    item: &WorkItem,
    task_id: &str,
    stage: Stage,
    zero_points: ZeroPointsPolicy,
) -> EngineResult<StageFacts> {
    // Contributors: humans only
    let (value, name) = required(item, LogicalField::Contributors(stage), task_id, stage)?;
    let people = value
        .as_people()
        .map_err(|e| EngineError::wrong_type(task_id, stage, &name, &e))?;
    let mut humans = people.iter().filter(|p| p.is_human());
    let contributor = humans
        .next()
        .cloned()
        .ok_or_else(|| EngineError::missing_field(task_id, stage, &name, "has no human contributor"))?;
    let others: Vec<&str> = humans.map(|p| p.id.as_str()).collect();
    if !others.is_empty() {
        warn!(
            task_id,
            stage = %stage,
            credited = %contributor.id,
            ignored = ?others,
            "Several contributors on one stage; crediting the first"
        );
    }

    let end_time = date(required(item, LogicalField::EndTime(stage), task_id, stage)?, task_id, stage)?;
    let start_time = date(required(item, LogicalField::StartTime(stage), task_id, stage)?, task_id, stage)?;

    let (value, name) = required(item, LogicalField::TotalPoints, task_id, stage)?;
    let raw_points = value
        .as_number()
        .map_err(|e| EngineError::wrong_type(task_id, stage, &name, &e))?
        .ok_or_else(|| EngineError::missing_field(task_id, stage, &name, "is empty"))?;

    if !raw_points.is_finite() || raw_points < 0.0 {
        return Err(EngineError::missing_field(
            task_id,
            stage,
            &name,
            format!("holds an invalid value {}", raw_points),
        ));
    }
    if raw_points == 0.0 && zero_points == ZeroPointsPolicy::TreatAsMissing {
        return Err(EngineError::missing_field(task_id, stage, &name, "is zero"));
    }

    Ok(StageFacts {
        contributor,
        start_time,
        end_time,
        raw_points,
    })
}

fn required<'a>(
    item: &'a WorkItem,
    field: LogicalField,
    task_id: &str,
    stage: Stage,
) -> EngineResult<(&'a FieldValue, String)> {
    let name = item.field_name(field);
    match item.get(field) {
        Some(value) => Ok((value, name)),
        None => Err(EngineError::missing_field(
            task_id,
            stage,
            &name,
            "is not present in the source collection",
        )),
    }
}

fn date(field: (&FieldValue, String), task_id: &str, stage: Stage) -> EngineResult<DateTime<Utc>> {
    let (value, name) = field;
    value
        .as_date_range()
        .map_err(|e| EngineError::wrong_type(task_id, stage, &name, &e))?
        .map(|range| range.start)
        .ok_or_else(|| EngineError::missing_field(task_id, stage, &name, "is empty"))
}
