//! End-to-end scenarios over `LocalBroker` + `MemoryStore`.

mod common;

use common::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crudcast::{
	Broker, ChangeMessage, CrudConfig, Document, Error, FilterPhase, FnHook, HookRequest,
	InboundRequest, ModelSchema, Query, ReadResult, SchemaRegistry, ViewSchema,
};

fn doc(value: Value) -> Document {
	match value {
		Value::Object(map) => map,
		_ => panic!("expected an object"),
	}
}

fn create_query(id: &str, name: &str, category: &str) -> Query {
	Query {
		r#type: "Product".to_string(),
		value: Some(json!({"id": id, "name": name, "categoryId": category})),
		..Default::default()
	}
}

fn update_query(id: &str, value: Value) -> Query {
	Query {
		r#type: "Product".to_string(),
		id: Some(id.to_string()),
		value: Some(value),
		..Default::default()
	}
}

// Scenario: create //
//******************//

#[tokio::test]
async fn test_create_publishes_resource_and_view_channels() {
	let rig = rig();
	let mut resource_rx = rig.broker.subscribe("crud>Product/p1").await.unwrap();
	let mut view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();

	let id = rig.service.create(create_query("p1", "A", "c1")).await.unwrap();
	assert_eq!(id, "p1");

	assert_eq!(recv_msg(&mut resource_rx).await.payload, None);
	assert_eq!(
		recv_msg(&mut view_rx).await.payload,
		Some(json!({"type": "create", "id": "p1"}))
	);
}

#[tokio::test]
async fn test_create_requires_an_object_value() {
	let rig = rig();
	let query = Query {
		r#type: "Product".to_string(),
		value: Some(json!("scalar")),
		..Default::default()
	};
	assert!(matches!(rig.service.create(query).await, Err(Error::InvalidParams(_))));
}

// Scenario: coalesced read //
//**************************//

#[tokio::test]
async fn test_concurrent_reads_coalesce_to_one_fetch() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let query = Query::resource("Product", "p1");
	let (a, b) = tokio::join!(
		rig.service.read(query.clone(), None),
		rig.service.read(query.clone(), None),
	);
	let a = unwrap_doc(a.unwrap());
	let b = unwrap_doc(b.unwrap());

	assert_eq!(a, b);
	assert_eq!(a.get("name"), Some(&json!("A")));
	assert_eq!(rig.store.fetch_count(), 1);
	// The invalidation pipeline is live once the read returned
	assert!(rig.broker.is_subscribed("crud>Product/p1").await);
}

#[tokio::test]
async fn test_read_of_missing_document_fails_for_every_waiter() {
	let rig = rig();
	let query = Query::resource("Product", "nope");
	let (a, b) = tokio::join!(
		rig.service.read(query.clone(), None),
		rig.service.read(query.clone(), None),
	);
	assert_eq!(a, Err(Error::NotFound));
	assert_eq!(b, Err(Error::NotFound));
	assert_eq!(rig.store.fetch_count(), 1);
}

#[tokio::test]
async fn test_read_single_field() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let query = Query {
		field: Some("name".to_string()),
		..Query::resource("Product", "p1")
	};
	assert_eq!(rig.service.read(query, None).await, Ok(ReadResult::Field(json!("A"))));
}

#[tokio::test]
async fn test_update_invalidates_cached_reads() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let query = Query::resource("Product", "p1");
	rig.service.read(query.clone(), None).await.unwrap();
	rig.service.read(query.clone(), None).await.unwrap();
	assert_eq!(rig.store.fetch_count(), 1);

	rig.service.update(update_query("p1", json!({"name": "B"}))).await.unwrap();
	// Let the resource channel watcher observe the change
	tokio::time::sleep(Duration::from_millis(50)).await;

	let fresh = unwrap_doc(rig.service.read(query, None).await.unwrap());
	assert_eq!(fresh.get("name"), Some(&json!("B")));
	assert_eq!(rig.store.fetch_count(), 2);
}

// Scenario: update with param change //
//************************************//

#[tokio::test]
async fn test_update_with_param_change_removes_and_adds() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let mut resource_rx = rig.broker.subscribe("crud>Product/p1").await.unwrap();
	let mut field_rx = rig.broker.subscribe("crud>Product/p1/categoryId").await.unwrap();
	let mut old_view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();
	let mut new_view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c2\"}):Product").await.unwrap();

	rig.service.update(update_query("p1", json!({"categoryId": "c2"}))).await.unwrap();

	assert_eq!(recv_msg(&mut resource_rx).await.payload, None);
	assert_eq!(
		recv_msg(&mut field_rx).await.payload,
		Some(json!({"type": "update", "value": "c2"}))
	);
	assert_eq!(
		recv_msg(&mut old_view_rx).await.payload,
		Some(json!({"type": "update", "action": "remove", "id": "p1"}))
	);
	assert_eq!(
		recv_msg(&mut new_view_rx).await.payload,
		Some(json!({"type": "update", "action": "add", "id": "p1"}))
	);
}

// Scenario: update with affecting change //
//****************************************//

#[tokio::test]
async fn test_update_with_affecting_change_moves_in_place() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let mut view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();

	rig.service.update(update_query("p1", json!({"price": 9}))).await.unwrap();

	assert_eq!(
		recv_msg(&mut view_rx).await.payload,
		Some(json!({"type": "update", "action": "move", "id": "p1"}))
	);
}

#[tokio::test]
async fn test_update_without_view_impact_publishes_no_view_message() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let mut view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();

	// name is neither a param nor an affecting field
	rig.service.update(update_query("p1", json!({"name": "B"}))).await.unwrap();
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert!(matches!(
		view_rx.try_recv(),
		Err(tokio::sync::broadcast::error::TryRecvError::Empty)
	));
}

#[tokio::test]
async fn test_update_rejects_id_modification() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let query = Query {
		field: Some("id".to_string()),
		value: Some(json!("p2")),
		..Query::resource("Product", "p1")
	};
	assert!(matches!(rig.service.update(query).await, Err(Error::InvalidOperation(_))));

	assert!(matches!(
		rig.service.update(update_query("p1", json!({"id": "p2"}))).await,
		Err(Error::InvalidOperation(_))
	));
}

// Scenario: delete //
//******************//

#[tokio::test]
async fn test_delete_publishes_field_and_view_deletions() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let mut field_rxs = Vec::new();
	for field in ["id", "name", "categoryId", "price"] {
		let chan = format!("crud>Product/p1/{}", field);
		field_rxs.push(rig.broker.subscribe(&chan).await.unwrap());
	}
	let mut view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();

	rig.service
		.delete(Query::resource("Product", "p1"))
		.await
		.unwrap();

	for rx in &mut field_rxs {
		assert_eq!(recv_msg(rx).await.payload, Some(json!({"type": "delete"})));
	}
	assert_eq!(
		recv_msg(&mut view_rx).await.payload,
		Some(json!({"type": "delete", "id": "p1"}))
	);
	assert!(rig.store.is_empty("Product"));
}

#[tokio::test]
async fn test_delete_single_field_publishes_field_deletion_only() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();
	rig.service.update(update_query("p1", json!({"price": 5}))).await.unwrap();

	let mut field_rx = rig.broker.subscribe("crud>Product/p1/price").await.unwrap();
	let mut view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();

	let query = Query {
		field: Some("price".to_string()),
		..Query::resource("Product", "p1")
	};
	rig.service.delete(query).await.unwrap();

	assert_eq!(recv_msg(&mut field_rx).await.payload, Some(json!({"type": "delete"})));
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(matches!(
		view_rx.try_recv(),
		Err(tokio::sync::broadcast::error::TryRecvError::Empty)
	));

	let fetched = unwrap_doc(
		rig.service.read(Query::resource("Product", "p1"), None).await.unwrap(),
	);
	assert!(fetched.get("price").is_none());
}

// Scenario: collection reads //
//****************************//

#[tokio::test]
async fn test_collection_read_pages_and_counts() {
	let rig = rig();
	rig.service.create(create_query("p1", "B", "c1")).await.unwrap();
	rig.service.create(create_query("p2", "A", "c1")).await.unwrap();
	rig.service.create(create_query("p3", "C", "c1")).await.unwrap();
	rig.service.create(create_query("p4", "Z", "c2")).await.unwrap();

	let query = Query {
		r#type: "Product".to_string(),
		view: Some("byCat".to_string()),
		view_params: Some(doc(json!({"categoryId": "c1"}))),
		page_size: Some(2),
		get_count: Some(true),
		..Default::default()
	};
	let page = unwrap_page(rig.service.read(query.clone(), None).await.unwrap());
	assert_eq!(page.data, ["p2", "p1"]);
	assert!(!page.is_last_page);
	assert_eq!(page.count, Some(3));

	let last = Query { offset: Some(2), ..query };
	let page = unwrap_page(rig.service.read(last, None).await.unwrap());
	assert_eq!(page.data, ["p3"]);
	assert!(page.is_last_page);
}

#[tokio::test]
async fn test_collection_read_requires_declared_params() {
	let rig = rig();
	let query = Query {
		r#type: "Product".to_string(),
		view: Some("byCat".to_string()),
		..Default::default()
	};
	assert!(matches!(rig.service.read(query, None).await, Err(Error::InvalidParams(_))));
}

#[tokio::test]
async fn test_unknown_model_type_is_rejected() {
	let rig = rig();
	assert!(matches!(
		rig.service.read(Query::resource("Order", "o1"), None).await,
		Err(Error::InvalidModelType(_))
	));
}

// Scenario: blocked subscribe //
//*****************************//

#[tokio::test]
async fn test_pre_filter_blocks_subscribe_without_fetch() {
	let by_cat = ViewSchema::new(&["categoryId"]);
	let product = ModelSchema::new(&["id", "name", "categoryId"])
		.with_view("byCat", by_cat)
		.with_pre_filter(Arc::new(FnHook(|_req: &HookRequest<'_>| -> Result<(), Error> {
			Err(Error::InvalidArguments("denied".to_string()))
		})));
	let schema = Arc::new(SchemaRegistry::new(HashMap::from([("Product".to_string(), product)])));
	let rig = rig_with(CrudConfig::default(), schema);

	let req = InboundRequest {
		socket: "s1".to_string(),
		event: "#subscribe".to_string(),
		channel: Some("crud>byCat({\"categoryId\":\"c1\"}):Product".to_string()),
		..Default::default()
	};
	assert!(matches!(
		rig.broker.subscribe_from(req).await,
		Err(Error::Blocked(FilterPhase::Pre))
	));
	// The post phase never ran, so nothing was fetched
	assert_eq!(rig.store.fetch_count(), 0);
}

#[tokio::test]
async fn test_post_filter_fetches_the_resource_through_the_cache() {
	let product = ModelSchema::new(&["id", "name", "categoryId"]).with_post_filter(Arc::new(
		FnHook(|req: &HookRequest<'_>| -> Result<(), Error> {
			let resource = req.resource.expect("post filter on a resource channel sees it");
			match resource.get("name") {
				Some(Value::String(name)) if name == "A" => Ok(()),
				_ => Err(Error::Blocked(FilterPhase::Post)),
			}
		}),
	));
	let schema = Arc::new(SchemaRegistry::new(HashMap::from([("Product".to_string(), product)])));
	let rig = rig_with(CrudConfig::default(), schema);
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();

	let req = InboundRequest {
		socket: "s1".to_string(),
		event: "#subscribe".to_string(),
		channel: Some("crud>Product/p1".to_string()),
		..Default::default()
	};
	assert!(rig.broker.subscribe_from(req).await.is_ok());
	assert_eq!(rig.store.fetch_count(), 1);

	// The post-phase fetch warmed the same cache ordinary reads use
	let fetched = unwrap_doc(
		rig.service.read(Query::resource("Product", "p1"), None).await.unwrap(),
	);
	assert_eq!(fetched.get("name"), Some(&json!("A")));
	assert_eq!(rig.store.fetch_count(), 1);
}

// Scenario: client publish denial //
//*********************************//

#[tokio::test]
async fn test_client_publish_to_crud_channel_is_rejected() {
	let rig = rig();
	let req = InboundRequest {
		socket: "s1".to_string(),
		event: "#publish".to_string(),
		channel: Some("crud>Product/p1".to_string()),
		data: Some(json!({"type": "update", "value": "spoofed"})),
		..Default::default()
	};
	assert!(matches!(
		rig.broker.publish_from(req).await,
		Err(Error::PublishNotAllowed(_))
	));
}

#[tokio::test]
async fn test_block_inbound_by_default_denies_unknown_emits() {
	let config = CrudConfig { block_inbound_by_default: true, ..Default::default() };
	let rig = rig_with(config, product_schema());

	let req = InboundRequest {
		socket: "s1".to_string(),
		event: "customEvent".to_string(),
		..Default::default()
	};
	assert!(matches!(
		rig.broker.emit_from(req).await,
		Err(Error::Blocked(FilterPhase::Pre))
	));

	let crud = InboundRequest {
		socket: "s1".to_string(),
		event: "read".to_string(),
		data: Some(json!({"type": "Product", "id": "p1"})),
		..Default::default()
	};
	assert!(rig.broker.emit_from(crud).await.is_ok());
}

// Scenario: out-of-band notifications //
//*************************************//

#[tokio::test]
async fn test_notify_update_emits_coarse_view_messages() {
	let rig = rig();
	let mut resource_rx = rig.broker.subscribe("crud>Product/p1").await.unwrap();
	let mut field_rx = rig.broker.subscribe("crud>Product/p1/categoryId").await.unwrap();
	let mut old_view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();
	let mut new_view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c2\"}):Product").await.unwrap();

	let old = doc(json!({"id": "p1", "name": "A", "categoryId": "c1"}));
	let new = doc(json!({"id": "p1", "name": "A", "categoryId": "c2"}));
	rig.service.notify_update("Product", &old, &new).await.unwrap();

	assert_eq!(recv_msg(&mut resource_rx).await.payload, None);
	assert_eq!(
		recv_msg(&mut field_rx).await.payload,
		Some(json!({"type": "update", "value": "c2"}))
	);
	// Coarse: both instances get a plain update, no move/remove/add action
	assert_eq!(
		recv_msg(&mut old_view_rx).await.payload,
		Some(json!({"type": "update", "id": "p1"}))
	);
	assert_eq!(
		recv_msg(&mut new_view_rx).await.payload,
		Some(json!({"type": "update", "id": "p1"}))
	);
}

#[tokio::test]
async fn test_notify_resource_update_clears_watched_resources() {
	let rig = rig();
	rig.service.create(create_query("p1", "A", "c1")).await.unwrap();
	rig.service.read(Query::resource("Product", "p1"), None).await.unwrap();
	assert_eq!(rig.store.fetch_count(), 1);

	rig.service.notify_resource_update("Product", "p1").await.unwrap();
	tokio::time::sleep(Duration::from_millis(50)).await;

	rig.service.read(Query::resource("Product", "p1"), None).await.unwrap();
	assert_eq!(rig.store.fetch_count(), 2);
}

#[tokio::test]
async fn test_notify_view_update_targets_one_instance() {
	let rig = rig();
	let mut view_rx =
		rig.broker.subscribe("crud>byCat({\"categoryId\":\"c1\"}):Product").await.unwrap();

	rig.service
		.notify_view_update(
			"Product",
			"byCat",
			&doc(json!({"categoryId": "c1", "rogue": true})),
			ChangeMessage::view_create("p9"),
		)
		.await
		.unwrap();

	assert_eq!(
		recv_msg(&mut view_rx).await.payload,
		Some(json!({"type": "create", "id": "p9"}))
	);
}
