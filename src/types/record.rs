//! The record shape written to the external store.

use serde::{Deserialize, Serialize};

use super::request::MatchRequest;

/// A row in the matches table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    #[serde(
        rename = "Approval Status",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub approval_status: Option<String>,

    /// Linked-record fields take a list even for a single link.
    #[serde(rename = "Learner")]
    pub learner: Vec<String>,

    #[serde(rename = "Tutor")]
    pub tutor: Vec<String>,

    #[serde(rename = "Overlapping Available Time Slots")]
    pub overlapping_time_slots: Vec<String>,
}

impl MatchRecord {
    /// Builds the record for a validated request.
    ///
    /// Overlapping slots keep the learner's order and appear once each.
    pub fn from_request(request: &MatchRequest) -> Self {
        let mut overlapping: Vec<String> = Vec::new();
        for slot in &request.learner_time_slots {
            if request.tutor_time_slots.contains(slot) && !overlapping.contains(slot) {
                overlapping.push(slot.clone());
            }
        }

        MatchRecord {
            approval_status: request.approval_status.clone(),
            learner: vec![request.learner.clone()],
            tutor: vec![request.tutor.clone()],
            overlapping_time_slots: overlapping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub fields: MatchRecord,
}

/// Request body for a batch create: `{"records": [{"fields": {...}}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecords {
    pub records: Vec<RecordFields>,
}

impl StoreRecords {
    pub fn single(record: MatchRecord) -> Self {
        StoreRecords {
            records: vec![RecordFields { fields: record }],
        }
    }

    pub fn for_request(request: &MatchRequest) -> Self {
        Self::single(MatchRecord::from_request(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> MatchRequest {
        MatchRequest::from_value(json!({
            "Tutor Available Time Slots": [
                "recGyyimRlFL5WNef",
                "recrwA7wQpzpESeTz",
                "rec4TUVd3TYRGE285",
                "rec10ZWVv9zgmsJEF",
                "recUsyMaDdZKZ3IKp"
            ],
            "Learner Available Time Slots": [
                "recGyyimRlFL5WNef",
                "rec4TUVd3TYRGE285",
                "recrwA7wQpzpESeTz",
                "recUsyMaDdZKZ3IKp",
                "recNotSharedXXXXX"
            ],
            "Tutor": "recuUhUFHYIQ6B3De",
            "Learner": "recJpeIQuMnAlfJ1R",
            "Approval Status": "Requested"
        }))
        .unwrap()
    }

    #[test]
    fn overlap_keeps_learner_order() {
        let record = MatchRecord::from_request(&sample_request());

        assert_eq!(record.approval_status.as_deref(), Some("Requested"));
        assert_eq!(record.learner, vec!["recJpeIQuMnAlfJ1R"]);
        assert_eq!(record.tutor, vec!["recuUhUFHYIQ6B3De"]);
        assert_eq!(
            record.overlapping_time_slots,
            vec![
                "recGyyimRlFL5WNef",
                "rec4TUVd3TYRGE285",
                "recrwA7wQpzpESeTz",
                "recUsyMaDdZKZ3IKp"
            ]
        );
    }

    #[test]
    fn single_string_slots_without_overlap() {
        let request = MatchRequest::from_value(json!({
            "Learner": "recJpeIQuMnAlfJ1R",
            "Tutor": "recuUhUFHYIQ6B3De",
            "Approval Status": "Requested",
            "Learner Available Time Slots": "rec4TUVd3TYRGE285",
            "Tutor Available Time Slots": "recGyyimRlFL5WNef",
        }))
        .unwrap();

        let record = MatchRecord::from_request(&request);
        assert!(record.overlapping_time_slots.is_empty());
    }

    #[test]
    fn repeated_slots_appear_once() {
        let request = MatchRequest::from_value(json!({
            "Learner": "L1",
            "Tutor": "T1",
            "Learner Available Time Slots": ["a", "b", "a"],
            "Tutor Available Time Slots": ["a", "a"],
        }))
        .unwrap();

        let record = MatchRecord::from_request(&request);
        assert_eq!(record.overlapping_time_slots, vec!["a"]);
    }

    #[test]
    fn wire_shape() {
        let body = serde_json::to_value(StoreRecords::for_request(&sample_request())).unwrap();

        let fields = &body["records"][0]["fields"];
        assert_eq!(fields["Approval Status"], "Requested");
        assert_eq!(fields["Learner"], json!(["recJpeIQuMnAlfJ1R"]));
        assert_eq!(fields["Tutor"], json!(["recuUhUFHYIQ6B3De"]));
        assert_eq!(
            fields["Overlapping Available Time Slots"]
                .as_array()
                .map(Vec::len),
            Some(4)
        );
        assert_eq!(body["records"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn missing_approval_status_is_omitted() {
        let request = MatchRequest::from_value(json!({ "Learner": "L1", "Tutor": "T1" })).unwrap();
        let body = serde_json::to_value(StoreRecords::for_request(&request)).unwrap();
        assert!(body["records"][0]["fields"].get("Approval Status").is_none());
    }
}
