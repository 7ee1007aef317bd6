//! Integration tests for the REST store.
//!
//! These tests use wiremock to simulate a PostgREST endpoint
//! and verify paging, parsing, upserts and error handling.

use chrono::{NaiveDate, NaiveTime};
use session_forecast::{
    ForecastRow, ForecastStore, RestStore, RiskFlag, config::NetworkConfig,
    models::{AttendanceEvent, CalendarDay},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path, query_param},
};

fn network() -> NetworkConfig {
    NetworkConfig {
        request_timeout_secs: 10,
        connect_timeout_secs: 5,
    }
}

fn store(server: &MockServer, page_size: usize) -> RestStore {
    RestStore::new(
        &server.uri(),
        "service-key",
        "session_forecast_next_14_days".to_string(),
        page_size,
        &network(),
    )
    .expect("Store creation should succeed")
}

async fn mount_empty(server: &MockServer, table: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/rest/v1/{}", table)))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(server)
        .await;
}

/// Test that a table is fetched page by page until a short page.
#[tokio::test]
async fn test_fetch_table_pages_until_short_page() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/work_calendar"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[
                {"the_date": "2024-12-24", "is_business_day": true, "holiday_name": "Christmas Eve"},
                {"the_date": "2024-12-25", "is_business_day": false, "holiday_name": "Christmas Day"}
            ]"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/work_calendar"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{"the_date": "2024-12-26", "is_business_day": true, "holiday_name": null}]"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rows: Vec<CalendarDay> = store(&mock_server, 2)
        .fetch_table("work_calendar")
        .await
        .expect("Fetch should succeed");

    assert_eq!(rows.len(), 3);
    assert!(!rows[1].is_business_day);
    assert_eq!(rows[2].holiday_name, None);
}

/// Test that the API key is sent in both PostgREST headers.
#[tokio::test]
async fn test_requests_carry_auth_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/member_holds"))
        .and(header("apikey", "service-key"))
        .and(header("authorization", "Bearer service-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rows: Vec<session_forecast::MemberHold> = store(&mock_server, 100)
        .fetch_table("member_holds")
        .await
        .unwrap();
    assert!(rows.is_empty());
}

/// Test that integer member ids from JSON are accepted.
#[tokio::test]
async fn test_attendance_with_integer_member_ids() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/member_daily_sessions_attended"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{
                "session_date": "2024-03-04",
                "session_start": "06:00:00",
                "session_end": "07:00:00",
                "session_name": "PERFORM",
                "coach_name": "Sam Lee, Jo Park",
                "member_id": 1042
            }]"#,
        ))
        .mount(&mock_server)
        .await;

    let rows: Vec<AttendanceEvent> = store(&mock_server, 100)
        .fetch_table("member_daily_sessions_attended")
        .await
        .unwrap();

    assert_eq!(rows[0].member_id, "1042");
    assert_eq!(rows[0].coach_name.as_deref(), Some("Sam Lee, Jo Park"));
}

/// Test loading every input table at once.
#[tokio::test]
async fn test_load_inputs_reads_all_tables() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/system_config"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{"config_key": "box_capacity", "capacity": 12, "match_pattern": "BOX"}]"#,
        ))
        .mount(&mock_server)
        .await;
    mount_empty(&mock_server, "member_daily_sessions_attended").await;
    mount_empty(&mock_server, "work_calendar").await;
    mount_empty(&mock_server, "member_holds").await;

    let inputs = store(&mock_server, 100).load_inputs().await.unwrap();

    assert!(inputs.attendance.is_empty());
    assert_eq!(inputs.capacity_rules.len(), 1);
    assert_eq!(inputs.capacity_rules[0].capacity, Some(12.0));
}

/// Test handling of server error responses.
#[tokio::test]
async fn test_fetch_server_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/work_calendar"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let result: anyhow::Result<Vec<CalendarDay>> =
        store(&mock_server, 100).fetch_table("work_calendar").await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("500"), "Error should mention status: {}", err);
}

/// Test handling of malformed JSON.
#[tokio::test]
async fn test_fetch_invalid_json() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/work_calendar"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
        .mount(&mock_server)
        .await;

    let result: anyhow::Result<Vec<CalendarDay>> =
        store(&mock_server, 100).fetch_table("work_calendar").await;

    assert!(result.is_err());
}

/// Test that forecasts are upserted with merge-duplicates on the forecast key.
#[tokio::test]
async fn test_upsert_posts_rows_with_merge_header() {
    let mock_server = MockServer::start().await;

    let row = ForecastRow {
        session_date: NaiveDate::from_ymd_opt(2024, 6, 17).unwrap(),
        session_name: "BOX".to_string(),
        session_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        session_end: NaiveTime::from_hms_opt(7, 0, 0),
        predicted_attendance: 10.5,
        predicted_utilisation: Some(0.875),
        risk_flag: RiskFlag::Amber,
    };

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_forecast_next_14_days"))
        .and(query_param(
            "on_conflict",
            "session_date,session_name,session_start",
        ))
        .and(header("prefer", "resolution=merge-duplicates,return=minimal"))
        .and(body_json(serde_json::json!([{
            "session_date": "2024-06-17",
            "session_name": "BOX",
            "session_start": "06:00:00",
            "session_end": "07:00:00",
            "predicted_attendance": 10.5,
            "predicted_utilisation": 0.875,
            "risk_flag": "amber"
        }])))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let written = store(&mock_server, 100)
        .upsert_forecasts(&[row])
        .await
        .expect("Upsert should succeed");

    assert_eq!(written, 1);
}

/// Test that an empty upsert does not hit the server.
#[tokio::test]
async fn test_upsert_empty_is_noop() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let written = store(&mock_server, 100).upsert_forecasts(&[]).await.unwrap();
    assert_eq!(written, 0);
}

/// Test that a rejected upsert surfaces as an error.
#[tokio::test]
async fn test_upsert_conflict_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/session_forecast_next_14_days"))
        .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
        .mount(&mock_server)
        .await;

    let row = ForecastRow {
        session_date: NaiveDate::from_ymd_opt(2024, 6, 17).unwrap(),
        session_name: "BOX".to_string(),
        session_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        session_end: None,
        predicted_attendance: 1.0,
        predicted_utilisation: None,
        risk_flag: RiskFlag::Black,
    };

    let result = store(&mock_server, 100).upsert_forecasts(&[row]).await;
    assert!(result.is_err());
}
