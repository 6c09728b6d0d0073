//! Shaping raw detections plus match outcomes into published results.

use crate::model::RawDetection;
use crate::types::{FaceResult, Gender, MatchResult};
use chrono::{Datelike, NaiveDate};

/// Build the published record for one detection.
///
/// Identity fields come from `outcome` only when it is an accepted match.
/// A matched date of birth takes precedence over the model's age estimate.
pub fn project(detection: &RawDetection, outcome: &MatchResult, today: NaiveDate) -> FaceResult {
    let matched = outcome.is_known().then_some(outcome);

    let age = matched
        .and_then(|m| m.dob.as_deref())
        .and_then(|dob| calculate_age(dob, today))
        .map(|years| years as f32)
        .or(detection.age);

    let gender = detection
        .gender_label
        .as_deref()
        .map(Gender::from_label)
        .or_else(|| matched.and_then(|m| m.gender));

    FaceResult {
        id: uuid::Uuid::new_v4().simple().to_string(),
        bbox: detection.bbox,
        score: Some(detection.score),
        age,
        gender,
        expressions: detection.expression_scores.clone(),
        name: matched.map(|m| m.name.clone()),
        dob: matched.and_then(|m| m.dob.clone()),
    }
}

/// Age in completed years on `today` for a `YYYY-MM-DD` date of birth.
pub fn calculate_age(dob: &str, today: NaiveDate) -> Option<i32> {
    let birth = NaiveDate::parse_from_str(dob.trim(), "%Y-%m-%d").ok()?;
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    Some(age)
}
