#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Navigation filtering through includes and projections, against the
//! in-memory provider.

mod common;

use common::{Customer, Order, OrderLine, OrderStatus, Principal, db, regional_rules, shop};
use entity_access::{AccessError, DefaultPolicy, ERROR_KEY, Expr, SecurityRules, Value};
use tokio_util::sync::CancellationToken;

fn names(values: &[Value], property: &str) -> Vec<Value> {
    values
        .iter()
        .map(|v| v.field(property).unwrap_or_default())
        .collect()
}

fn list(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::List(items)) => items,
        _ => panic!("expected a list"),
    }
}

#[tokio::test]
async fn test_included_reference_respects_target_rule() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");
    let cancel = CancellationToken::new();

    let rows = db
        .query::<Order>()
        .unwrap()
        .include("customer")
        .unwrap()
        .to_list(&cancel)
        .await
        .unwrap();

    assert_eq!(rows.len(), 3, "orders have no rule and stay visible");
    let customers: Vec<Value> = rows
        .iter()
        .map(|o| o.field("customer").unwrap_or_default())
        .collect();
    assert_eq!(customers[0].field("name"), Some(Value::from("Ada")));
    assert_eq!(customers[1].field("name"), Some(Value::from("Ada")));
    assert!(customers[2].is_null(), "EU customer must be filtered out");
    assert!(
        customers[0]
            .as_object()
            .unwrap()
            .ptr_eq(customers[1].as_object().unwrap()),
        "one customer materializes once per query"
    );
}

#[tokio::test]
async fn test_navigations_not_included_stay_unloaded() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let rows = db
        .query::<Order>()
        .unwrap()
        .to_list(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(rows[0].field("customer"), Some(Value::Null));
    assert!(list(rows[0].field("lines")).is_empty());
    assert_eq!(rows[0].field("total"), Some(Value::Int(250)));
    assert_eq!(rows[0].field("status"), Some(Value::Enum("Open")));
}

#[tokio::test]
async fn test_included_collection_respects_target_rule() {
    let shop = shop();
    let rules = regional_rules().select::<OrderLine, _>(|q, _| {
        Ok(q.filter(|l| l.member("qty").greater_than(0)))
    });
    let db = db(&shop, rules, "US");

    let query = db.query::<Order>().unwrap().include("lines").unwrap();
    assert!(query.to_query_string().contains("Where"));
    let rows = query.to_list(&CancellationToken::new()).await.unwrap();

    let first = list(rows[0].field("lines"));
    assert_eq!(names(&first, "sku"), vec![Value::from("apple")]);
    assert_eq!(list(rows[1].field("lines")).len(), 1);
    assert!(list(rows[2].field("lines")).is_empty());
}

#[tokio::test]
async fn test_then_include_filters_every_hop() {
    let shop = shop();
    let rules = regional_rules()
        .select::<Order, _>(|q, _| Ok(q.filter(|o| o.member("total").greater_than(100))))
        .select::<OrderLine, _>(|q, _| Ok(q.filter(|l| l.member("qty").greater_than(0))));
    let db = db(&shop, rules, "US");
    let cancel = CancellationToken::new();

    let chained = db
        .query::<Customer>()
        .unwrap()
        .include("orders")
        .unwrap()
        .then_include("lines")
        .unwrap()
        .to_list(&cancel)
        .await
        .unwrap();
    let dotted = db
        .query::<Customer>()
        .unwrap()
        .include("Orders.Lines")
        .unwrap()
        .to_list(&cancel)
        .await
        .unwrap();

    for rows in [&chained, &dotted] {
        assert_eq!(names(rows, "name"), vec![Value::from("Ada")]);
        let orders = list(rows[0].field("orders"));
        assert_eq!(names(&orders, "id"), vec![Value::Int(1)]);
        let lines = list(orders[0].field("lines"));
        assert_eq!(names(&lines, "id"), vec![Value::Int(11)]);
    }
}

#[tokio::test]
async fn test_include_with_composes_client_filter() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let rows = db
        .query::<Customer>()
        .unwrap()
        .include_with(|c| {
            c.member("orders")
                .filter(|o| o.member("status").equals(OrderStatus::Open))
        })
        .unwrap()
        .to_list(&CancellationToken::new())
        .await
        .unwrap();

    let orders = list(rows[0].field("orders"));
    assert_eq!(names(&orders, "id"), vec![Value::Int(1)]);
}

#[tokio::test]
async fn test_collection_projection_is_materialized() {
    let shop = shop();
    let rules = regional_rules().select::<OrderLine, _>(|q, _| {
        Ok(q.filter(|l| l.member("qty").greater_than(0)))
    });
    let db = db(&shop, rules, "US");

    let query = db.query::<Order>().unwrap().select(|o| o.member("lines")).unwrap();
    let Expr::Select { projection, .. } = query.expression() else {
        panic!("expected a projection");
    };
    assert!(matches!(projection.body(), Expr::ToList(_)));

    let rows = query.to_list(&CancellationToken::new()).await.unwrap();
    assert_eq!(names(rows[0].as_list().unwrap(), "sku"), vec![Value::from("apple")]);
    assert!(rows[2].as_list().unwrap().is_empty());
}

#[tokio::test]
async fn test_record_projection_filters_members() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "EU");

    let rows = db
        .query::<Order>()
        .unwrap()
        .select(|o| {
            Expr::record(
                "OrderSummary",
                [("id", o.member("id")), ("customer", o.member("customer"))],
            )
        })
        .unwrap()
        .to_list(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].field("customer"), Some(Value::Null));
    let bjorn = rows[2].field("customer").unwrap();
    assert_eq!(bjorn.field("name"), Some(Value::from("Bjorn")));
    assert!(list(bjorn.field("orders")).is_empty(), "navigations of projected entities stay unloaded");
}

#[tokio::test]
async fn test_ignored_navigation_is_never_loaded() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");
    let cancel = CancellationToken::new();

    let included = db
        .query::<Order>()
        .unwrap()
        .include("reviewer")
        .unwrap()
        .to_list(&cancel)
        .await
        .unwrap();
    assert!(included.iter().all(|o| o.field("reviewer") == Some(Value::Null)));

    let projected = db
        .query::<Order>()
        .unwrap()
        .select(|o| o.member("reviewer").member("name"))
        .unwrap()
        .to_list(&cancel)
        .await
        .unwrap();
    assert_eq!(projected, vec![Value::Null; 3]);
}

#[tokio::test]
async fn test_requires_records_message_and_filters() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let query = db
        .query::<Order>()
        .unwrap()
        .requires(|o| o.member("total").greater_than(10_000), "no order is large enough");
    let sink = query.errors().clone();
    let rows = query.to_list(&CancellationToken::new()).await.unwrap();

    assert!(rows.is_empty());
    assert_eq!(sink.messages(ERROR_KEY), vec!["no order is large enough".to_owned()]);
}

#[tokio::test]
async fn test_navigation_rule_diagnostics_reach_the_query() {
    let shop = shop();
    let rules = SecurityRules::<Principal>::builder().select::<Customer, _>(|q, p| {
        let region = p.region.clone();
        Ok(q.requires(move |c| c.member("region").equals(region), "customer outside region"))
    });
    let db = db(&shop, rules, "US");

    let query = db.query::<Order>().unwrap().include("customer").unwrap();
    let sink = query.errors().clone();
    let rows = query.to_list(&CancellationToken::new()).await.unwrap();

    assert_eq!(sink.messages(ERROR_KEY), vec!["customer outside region".to_owned()]);
    assert!(rows[2].field("customer").unwrap_or_default().is_null());
}

#[tokio::test]
async fn test_multi_hop_include_body_is_rejected() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let result = db
        .query::<Order>()
        .unwrap()
        .include_with(|o| o.member("customer").member("orders"));
    assert!(matches!(
        result,
        Err(AccessError::InvalidPath { ref reason, .. }) if reason.contains("then_include")
    ));

    let result = db.query::<Order>().unwrap().include_with(|o| o.member("total").equals(1));
    assert!(matches!(result, Err(AccessError::InvalidPath { .. })));

    let rows = db
        .query::<Order>()
        .unwrap()
        .include("customer")
        .unwrap()
        .then_include("orders")
        .unwrap()
        .to_list(&CancellationToken::new())
        .await
        .unwrap();
    let customer = rows[0].field("customer").unwrap();
    assert_eq!(list(customer.field("orders")).len(), 2);
}

#[tokio::test]
async fn test_ordering_and_paging() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let rows = db
        .query::<Order>()
        .unwrap()
        .order_by(|o| o.member("status"))
        .then_by_descending(|o| o.member("total"))
        .skip(1)
        .take(2)
        .to_list(&CancellationToken::new())
        .await
        .unwrap();

    // Closed(40), Open(900), Open(250) -> skip 1, take 2
    assert_eq!(names(&rows, "id"), vec![Value::Int(3), Value::Int(1)]);
}

#[tokio::test]
async fn test_unknown_include_path_is_rejected() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");

    let result = db.query::<Order>().unwrap().include("customer.nope");
    assert!(matches!(result, Err(AccessError::InvalidPath { .. })));
    let result = db.query::<Order>().unwrap().include("");
    assert!(matches!(result, Err(AccessError::InvalidPath { .. })));
}

#[tokio::test]
async fn test_default_deny_select_yields_nothing() {
    let shop = shop();
    let db = db(&shop, regional_rules().default_select(DefaultPolicy::Deny), "US");
    let cancel = CancellationToken::new();

    let orders = db.query::<Order>().unwrap();
    assert_eq!(orders.count(&cancel).await.unwrap(), 0);

    let customers = db.query::<Customer>().unwrap().to_list(&cancel).await.unwrap();
    assert_eq!(names(&customers, "name"), vec![Value::from("Ada")]);
}

#[tokio::test]
async fn test_cancelled_token_aborts_execution() {
    let shop = shop();
    let db = db(&shop, regional_rules(), "US");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = db.query::<Order>().unwrap().to_list(&cancel).await;
    assert!(matches!(result, Err(AccessError::Cancelled)));
}
