use quarry::registry::{Cardinality, FieldType, Registry, RegistryError};

const CATALOG: &str = r#"
[sources.orders]
label = "Orders"
category = "sales"
table = "shop_orders"
model = "Order"
tenant_column = "account_id"

[sources.orders.fields.id]
type = "number"
sortable = true

[sources.orders.fields.placed_at]
label = "Placed"
type = "datetime"
filterable = true
sortable = true
column = "created"

[sources.orders.fields.client_id]
type = "number"

[sources.orders.relations.client]
target = "clients"
local_field = "client_id"
foreign_field = "id"

[sources.orders.relations.ghost]
target = "nowhere"

[sources.clients]
table = "clients"
model = "Client"

[sources.clients.fields.id]
type = "number"

[sources.drafts]
table = "drafts"
model = ""

[sources.drafts.fields.id]
type = "number"
"#;

#[test]
fn test_custom_catalog_metadata() {
    let registry = Registry::from_toml_str(CATALOG).unwrap();
    assert_eq!(registry.len(), 3);

    let orders = registry.get("orders").unwrap();
    assert_eq!(orders.label, "Orders");
    assert_eq!(orders.tenant_column, "account_id");

    let placed = registry.field("orders", "placed_at").unwrap();
    assert_eq!(placed.data_type, FieldType::DateTime);
    assert_eq!(placed.column_name(), "created");
    assert!(placed.data_type.is_temporal());

    let id = registry.field("orders", "id").unwrap();
    assert_eq!(id.label, "id");
    assert_eq!(id.column_name(), "id");

    let client = &registry.relations("orders").unwrap()["client"];
    assert_eq!(client.cardinality, Cardinality::ManyToOne);
}

#[test]
fn test_source_and_relation_validity() {
    let registry = Registry::from_toml_str(CATALOG).unwrap();

    assert!(registry.is_valid_source("orders"));
    assert!(registry.is_valid_source("clients"));
    // Empty model: loads but never validates
    assert!(!registry.is_valid_source("drafts"));
    assert!(!registry.is_valid_source("missing"));

    assert!(registry.is_valid_relation("orders", "client"));
    assert!(!registry.is_valid_relation("orders", "ghost"));
    assert!(!registry.is_valid_relation("orders", "unknown"));
}

#[test]
fn test_capability_flags() {
    let registry = Registry::from_toml_str(CATALOG).unwrap();
    assert!(registry.is_filterable("orders", "placed_at"));
    assert!(registry.is_sortable("orders", "id"));
    assert!(!registry.is_filterable("orders", "id"));
    assert!(!registry.is_aggregatable("orders", "id"));
    assert!(!registry.is_sortable("orders", "nope"));
}

#[test]
fn test_resolve_field() {
    let registry = Registry::builtin().unwrap();
    let (source, field) = registry.resolve_field("invoices.total_amount").unwrap();
    assert_eq!(source.table, "invoices");
    assert_eq!(field.data_type, FieldType::Number);
    assert!(field.aggregatable);

    assert!(registry.resolve_field("invoices").is_none());
    assert!(registry.resolve_field("invoices.nope").is_none());
    assert!(registry.resolve_field("nope.id").is_none());
}

#[test]
fn test_rejects_unsafe_identifiers() {
    let err = Registry::from_toml_str(
        r#"
        [sources.bad]
        table = "bad; DROP TABLE x"
        model = "Bad"
        "#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::InvalidIdentifier { kind: "Table", .. }
    ));

    let err = Registry::from_toml_str(
        r#"
        [sources.ok]
        table = "ok"
        model = "Ok"
        [sources.ok.fields.name]
        type = "text"
        column = "name\" OR 1=1"
        "#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::InvalidIdentifier { kind: "Column", .. }
    ));
}

#[test]
fn test_rejects_unknown_keys() {
    let err = Registry::from_toml_str(
        r#"
        [sources.x]
        table = "x"
        model = "X"
        sql = "SELECT 1"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, RegistryError::Parse(_)));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.toml");
    std::fs::write(&path, CATALOG).unwrap();

    let registry = Registry::from_file(&path).unwrap();
    let keys: Vec<_> = registry.keys().collect();
    assert_eq!(keys, vec!["clients", "drafts", "orders"]);

    let missing = Registry::from_file(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(missing, RegistryError::Io(_)));
}
