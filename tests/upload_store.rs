use payroll_ingest::store::IngestSaveError;
use payroll_ingest::upload::UploadPayload;
use payroll_ingest::{
    handle_api, ingest_and_save, ApiRequest, BytesSource, CancellationToken, IngestConfig,
    StoreError, StreamingCsvIngestor, UploadStore,
};
use serde_json::{json, Value};
use std::time::Duration;

fn upload(body: &str) -> ApiRequest<'_> {
    ApiRequest {
        method: "POST",
        path: "/api/payroll/upload",
        content_type: Some("application/json; charset=utf-8"),
        body: body.as_bytes(),
    }
}

#[tokio::test]
async fn save_names_file_after_original_and_round_trips() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path().join("uploads")).await?;
    let records = json!([{"사번": "E1", "성명": "김민수"}, {"사번": "E2", "성명": "이영희"}]);

    let saved = store.save(Some("payroll_2024.xlsx"), &records).await?;
    assert!(saved.file_name.starts_with("payroll_2024_"));
    assert!(saved.file_name.ends_with(".json"));
    assert_eq!(saved.record_count, 2);
    assert_eq!(store.load(&saved.file_name).await?, records);

    let unnamed = store.save(None, &records).await?;
    assert!(unnamed.file_name.starts_with("payroll_"));
    assert!(unnamed.file_name.ends_with(".json"));
    assert_ne!(unnamed.file_name, saved.file_name);
    Ok(())
}

#[tokio::test]
async fn save_never_overwrites() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;
    let records = json!([["a"]]);

    let mut names = Vec::new();
    for _ in 0..5 {
        names.push(store.save(Some("march.json"), &records).await?.file_name);
    }
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 5);
    Ok(())
}

#[tokio::test]
async fn save_rejects_non_arrays() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;
    let err = store.save(None, &json!({"a": 1})).await.unwrap_err();
    assert!(matches!(err, StoreError::NotAnArray));
    Ok(())
}

#[tokio::test]
async fn list_and_delete_stored_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;
    std::fs::write(dir.path().join("notes.txt"), "ignored")?;

    let first = store.save(Some("jan.json"), &json!([1])).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = store.save(Some("feb.json"), &json!([1, 2])).await?;

    let listed = store.list().await?;
    let names: Vec<&str> = listed.iter().map(|f| f.file_name.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&first.file_name.as_str()));
    assert!(names.contains(&second.file_name.as_str()));
    assert!(listed[0].uploaded_at >= listed[1].uploaded_at);

    assert!(store.delete(&first.file_name).await?);
    assert!(!store.delete(&first.file_name).await?);
    assert!(matches!(
        store.delete("../escape.json").await,
        Err(StoreError::InvalidName(_))
    ));
    assert_eq!(store.list().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn envelope_upload_is_saved() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;
    let body = r#"{
        "fileName": "급여_3월.xlsx",
        "fileType": "xlsx",
        "uploadDate": "2024-03-25T09:00:00.000Z",
        "data": [["사번", "성명", "기본급"], ["E1", "김민수", NaN], ["E2", "이영희", 3100000],]
    }"#;

    let res = handle_api(&store, upload(body)).await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["success"], true);
    assert_eq!(res.body["recordCount"], 3);
    let file_name = res.body["fileName"].as_str().unwrap();
    assert!(file_name.starts_with("급여_3월_"));
    assert!(res.body["savedAt"].as_str().unwrap().ends_with('Z'));

    assert!(file_name.ends_with(".json"));
    assert_eq!(store.list().await?[0].file_name, file_name);

    let stored = store.load(file_name).await?;
    assert_eq!(stored[1][2], Value::Null);
    Ok(())
}

#[tokio::test]
async fn bare_array_upload_is_saved() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;

    let res = handle_api(&store, upload(r#"[{"사번": "E1", "성명": "김민수", "수당": Infinity}]"#)).await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["recordCount"], 1);
    assert!(res.body["fileName"].as_str().unwrap().starts_with("payroll_"));
    Ok(())
}

#[tokio::test]
async fn bad_uploads_are_rejected_with_400() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;

    for body in ["[]", r#"{"a": 1}"#, "{not json", r#"{"fileName": "x.json", "data": {}}"#] {
        let res = handle_api(&store, upload(body)).await;
        assert_eq!(res.status, 400, "body {body}");
        assert_eq!(res.body["success"], false);
        assert!(res.body["error"].is_string());
    }

    let mut form = upload("[1]");
    form.content_type = Some("multipart/form-data; boundary=x");
    assert_eq!(handle_api(&store, form).await.status, 400);

    let mut missing = upload("[1]");
    missing.content_type = None;
    assert_eq!(handle_api(&store, missing).await.status, 400);

    assert!(store.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_routes_are_404() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;

    let mut other = upload("[1]");
    other.path = "/api/payroll/list";
    assert_eq!(handle_api(&store, other).await.status, 404);

    let mut get = upload("[1]");
    get.method = "GET";
    assert_eq!(handle_api(&store, get).await.status, 404);
    Ok(())
}

#[tokio::test]
async fn storage_failure_is_500() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path().join("gone")).await?;
    std::fs::remove_dir_all(store.dir())?;

    let res = handle_api(&store, upload("[1]")).await;
    assert_eq!(res.status, 500);
    assert_eq!(res.body["success"], false);
    Ok(())
}

#[test]
fn payload_keeps_envelope_metadata() {
    let payload = UploadPayload::parse(
        r#"{"fileName": "a.json", "fileType": "json", "uploadDate": "2024-01-01T00:00:00Z", "data": [{"사번": 1}]}"#,
    )
    .unwrap();
    assert_eq!(payload.file_name.as_deref(), Some("a.json"));
    assert_eq!(payload.file_type.as_deref(), Some("json"));
    assert_eq!(payload.upload_date.as_deref(), Some("2024-01-01T00:00:00Z"));
    assert_eq!(payload.records.len(), 1);
}

#[tokio::test]
async fn ingest_and_save_persists_preview_rows() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;
    let source = BytesSource::new(
        "march.csv",
        "사번,성명,기본급\nE1,김민수,3000000\nE2,이영희,3100000\n".as_bytes().to_vec(),
    );

    let (report, saved) = ingest_and_save(
        &StreamingCsvIngestor::new(),
        &source,
        &IngestConfig::default(),
        &CancellationToken::new(),
        &store,
    )
    .await?;

    assert_eq!(report.rows.len(), 2);
    assert!(saved.file_name.starts_with("march_"));
    assert!(saved.file_name.ends_with(".json"));
    let stored = store.load(&saved.file_name).await?;
    assert_eq!(stored[1]["성명"], "이영희");
    assert_eq!(stored[0]["기본급"], "3000000");
    Ok(())
}

#[tokio::test]
async fn cancelled_ingestion_saves_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = UploadStore::open(dir.path()).await?;
    let source = BytesSource::new("march.csv", "a,b\n1,2\n".as_bytes().to_vec());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = ingest_and_save(
        &StreamingCsvIngestor::new(),
        &source,
        &IngestConfig::default(),
        &cancel,
        &store,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, IngestSaveError::Ingest(ref e) if e.is_cancelled()));
    assert!(store.list().await?.is_empty());
    Ok(())
}
