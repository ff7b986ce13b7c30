mod common;

use serde_json::json;

use common::{harness, node};
use flowway::context::{Scope, Variable};
use flowway::flow::{FlowControlOp, FlowMeta, FlowStorage};
use flowway::{FlowError, FlowState};

#[tokio::test]
async fn generated_flow_round_trips_through_storage() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;

    let meta = h.manager.generate_new_flow();
    assert!(h.manager.get_flow_by_id(&meta.id).is_none());

    let raw = serde_json::to_vec_pretty(&meta).unwrap();
    h.manager
        .update_flow_from_json_and_save_to_storage(&meta.id, &raw)
        .await
        .unwrap();

    let stored = std::fs::read(h.manager.storage().path_for(&meta.id).unwrap()).unwrap();
    assert_eq!(stored, raw);
    assert_eq!(h.manager.get_flow_definition(&meta.id).unwrap(), meta);
    assert_eq!(h.manager.get_flow_by_id(&meta.id).unwrap().state(), FlowState::Running);
}

#[tokio::test]
async fn file_name_decides_the_flow_id() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;

    let mut meta = FlowMeta::skeleton("declared");
    meta.nodes = vec![node("a", "gate", "b"), node("b", "step", "")];
    let path = dir.path().join("lights.json");
    std::fs::write(&path, serde_json::to_vec(&meta).unwrap()).unwrap();

    h.manager.load_flow_from_file(&path).await.unwrap();
    assert!(h.manager.get_flow_by_id("declared").is_none());
    let flow = h.manager.get_flow_by_id("lights").unwrap();
    assert_eq!(flow.node_count(), 2);
    assert_eq!(flow.definition().id, "lights");
}

#[tokio::test]
async fn start_on_running_flow_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;
    h.manager.import_flow(br#"{ "id": "f1" }"#).await.unwrap();

    let err = h.manager.control_flow(FlowControlOp::Start, "f1").await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::InvalidStateTransition { state: FlowState::Running, .. }
    ));
    assert!(matches!(
        h.manager.control_flow(FlowControlOp::Start, "ghost").await,
        Err(FlowError::NotFound(_))
    ));
}

#[tokio::test]
async fn stopped_flows_stay_stopped_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    {
        let h = harness(dir.path()).await;
        h.manager.import_flow(br#"{ "id": "f1" }"#).await.unwrap();
        h.manager.control_flow(FlowControlOp::Stop, "f1").await.unwrap();
        assert_eq!(h.manager.get_flow_by_id("f1").unwrap().state(), FlowState::Stopped);
        h.manager.shutdown().await;
    }

    let h = harness(dir.path()).await;
    assert_eq!(h.manager.load_all_flows_from_storage().await.unwrap(), 1);
    let flow = h.manager.get_flow_by_id("f1").unwrap();
    assert!(flow.is_disabled());
    assert_eq!(flow.state(), FlowState::Created);

    h.manager.control_flow(FlowControlOp::Start, "f1").await.unwrap();
    assert_eq!(flow.state(), FlowState::Running);
    assert!(!FlowStorage::new(dir.path().join("flows")).load("f1").await.unwrap().is_disabled);
}

#[tokio::test]
async fn invalid_update_keeps_the_running_flow() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;
    h.manager.import_flow(br#"{ "id": "f1", "name": "v1" }"#).await.unwrap();

    let broken = json!({ "id": "f1", "name": "v2", "nodes": [{ "id": "a", "type": "gate", "success_transition": "ghost" }] });
    let err = h
        .manager
        .update_flow_from_json_and_save_to_storage("f1", &serde_json::to_vec(&broken).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));

    let mismatched = serde_json::to_vec(&json!({ "id": "f2" })).unwrap();
    assert!(h
        .manager
        .update_flow_from_json_and_save_to_storage("f1", &mismatched)
        .await
        .is_err());

    let flow = h.manager.get_flow_by_id("f1").unwrap();
    assert_eq!(flow.definition().name, "v1");
    assert_eq!(flow.state(), FlowState::Running);
}

#[tokio::test]
async fn broken_node_config_leaves_flow_failed() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;
    let raw = json!({ "id": "f1", "nodes": [{ "id": "s", "type": "set_variable", "config": { "nme": "typo" } }] });
    h.manager
        .update_flow_from_json_and_save_to_storage("f1", &serde_json::to_vec(&raw).unwrap())
        .await
        .unwrap();

    let flow = h.manager.get_flow_by_id("f1").unwrap();
    assert_eq!(flow.state(), FlowState::Failed);
    assert!(flow.last_error().unwrap().contains("'s'"));
}

#[tokio::test]
async fn delete_removes_file_and_flow_variables() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;
    h.manager.import_flow(br#"{ "id": "f1" }"#).await.unwrap();
    let context = h.manager.context();
    context.set_variable("v", &Scope::flow("f1"), Variable::int(1)).await.unwrap();
    context.set_variable("g", &Scope::Global, Variable::int(2)).await.unwrap();

    h.manager.delete_flow_from_storage("f1").await.unwrap();
    assert!(h.manager.get_flow_by_id("f1").is_none());
    assert!(!h.manager.storage().path_for("f1").unwrap().exists());
    assert!(context.get_records(&Scope::flow("f1")).is_empty());
    assert_eq!(context.get_variable("g", &Scope::Global).unwrap(), Variable::int(2));

    // unknown ids are a no-op
    h.manager.delete_flow_from_storage("f1").await.unwrap();
}

#[tokio::test]
async fn list_is_sorted_and_reports_state() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;
    for id in ["b", "a", "c"] {
        h.manager.import_flow(format!(r#"{{ "id": "{}" }}"#, id).as_bytes()).await.unwrap();
    }
    h.manager.control_flow(FlowControlOp::Stop, "c").await.unwrap();

    let list = h.manager.get_flow_list();
    let ids: Vec<_> = list.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(list[2].state, FlowState::Stopped);
    assert!(list[2].is_disabled);
}

#[tokio::test]
async fn inclusion_report_lists_virtual_services() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;

    let raw = json!({
        "id": "f1",
        "name": "Lights",
        "nodes": [{
            "id": "t1",
            "type": "trigger",
            "address": "pt:j1/mt:cmd/rt:ad/rn:flowway/ad:f1",
            "service": "out_bin_switch",
            "service_interface": "cmd.binary.set",
            "config": {
                "register_as_virtual_service": true,
                "virtual_service_group": "ch_0",
                "virtual_service_props": { "sup_modes": ["on", "off"] }
            }
        }]
    });
    h.manager
        .update_flow_from_json_and_save_to_storage("f1", &serde_json::to_vec(&raw).unwrap())
        .await
        .unwrap();

    let topic = flowway::message::Address::new("evt", "ad", "flowway", "1").to_topic();
    let mut reports = h.bus.subscribe("test", &topic);
    h.manager
        .control_flow(FlowControlOp::SendInclusionReport, "f1")
        .await
        .unwrap();

    let report = tokio::time::timeout(std::time::Duration::from_secs(2), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.payload.msg_type, "evt.thing.inclusion_report");
    let service = &report.payload.value["services"][0];
    assert_eq!(service["name"], "out_bin_switch");
    assert_eq!(service["group"], "ch_0");
    assert_eq!(service["props"]["sup_modes"], json!(["on", "off"]));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn flow_id_cannot_shadow_the_global_scope() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path()).await;
    let context = h.manager.context();
    context
        .set_variable("mode", &Scope::Global, Variable::string("away"))
        .await
        .unwrap();

    let err = h.manager.import_flow(br#"{ "id": "global" }"#).await.unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
    assert!(h.manager.get_flow_by_id("global").is_none());

    h.manager.delete_flow_from_storage("global").await.unwrap();
    assert_eq!(
        context.get_variable("mode", &Scope::Global).unwrap(),
        Variable::string("away")
    );
}
