//! Property-based tests for the schema module.
//!
//! Covers SQL rendering invariants (create/insert/select), field lookup,
//! reference-field helpers, registry registration rules and value
//! conversions.

use proptest::prelude::*;

use tracemon::error::SchemaError;
use tracemon::schema::{
    self, Field, FieldType, HOST_REF, OUTPUT_REF, SchemaRegistry, TL_REF, Table, Value,
};

// =============================================================================
// Strategies
// =============================================================================

/// SQL-safe identifier, distinct from the reserved reference names.
fn arb_ident() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9_]{0,11}".prop_filter("reserved", |name| {
        name != HOST_REF && name != TL_REF && name != OUTPUT_REF
    })
}

fn arb_field_type() -> impl Strategy<Value = FieldType> {
    prop_oneof![
        Just(FieldType::Integer),
        Just(FieldType::Text),
        Just(FieldType::Real),
    ]
}

/// Field list with unique names, 1..6 entries.
fn arb_fields() -> impl Strategy<Value = Vec<Field>> {
    prop::collection::vec((arb_ident(), arb_field_type()), 1..6).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (name, field_type))| Field::new(format!("{name}_{i}"), field_type))
            .collect()
    })
}

fn arb_table() -> impl Strategy<Value = Table> {
    (arb_ident(), arb_fields())
        .prop_map(|(name, fields)| Table::new(format!("T_{name}"), fields, vec![], vec![]))
}

// =============================================================================
// SQL rendering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn create_sql_mentions_every_field(table in arb_table()) {
        let sql = table.create_sql();
        prop_assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS"));
        prop_assert!(sql.contains(table.name()));
        for field in table.fields() {
            prop_assert!(sql.contains(&field.name), "missing {} in {sql}", field.name);
        }
    }

    #[test]
    fn insert_sql_has_one_placeholder_per_field(table in arb_table()) {
        let sql = table.insert_sql();
        prop_assert_eq!(sql.matches('?').count(), table.fields().len());
        prop_assert_eq!(table.template().len(), table.fields().len());
    }

    #[test]
    fn select_sql_appends_where_clause(table in arb_table(), cond in "[A-Za-z0-9 =?]{1,20}") {
        let bare = table.select_sql(None);
        prop_assert!(!bare.contains("WHERE"));
        let filtered = table.select_sql(Some(&cond));
        prop_assert!(filtered.contains("WHERE"));
        prop_assert!(filtered.ends_with(&cond));
    }

    #[test]
    fn field_index_finds_every_field(table in arb_table()) {
        for (i, field) in table.fields().iter().enumerate() {
            prop_assert_eq!(table.field_index(&field.name), Some(i));
        }
        // identifiers never contain spaces
        prop_assert_eq!(table.field_index("no such field"), None);
    }

    #[test]
    fn primary_key_renders_exactly_once(name in arb_ident()) {
        let table = Table::new(
            "T",
            vec![Field::primary_key(name), Field::text("Payload")],
            vec![],
            vec![],
        );
        let sql = table.create_sql();
        prop_assert_eq!(sql.matches("PRIMARY KEY").count(), 1);
        prop_assert!(sql.contains("INTEGER PRIMARY KEY"));
    }
}

// =============================================================================
// Reference-field helpers
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn with_time_ref_prepends_both_references(base in arb_fields()) {
        let base_len = base.len();
        let (fields, fks) = schema::with_time_ref(base);
        prop_assert_eq!(fields.len(), base_len + 2);
        prop_assert_eq!(fields[0].name.as_str(), HOST_REF);
        prop_assert_eq!(fields[1].name.as_str(), TL_REF);
        prop_assert_eq!(fks.len(), 2);

        let table = Table::new("T", fields, fks, vec![]);
        prop_assert!(table.needs_time_ref());
        prop_assert!(table.create_sql().contains("FOREIGN KEY(TL_REF) REFERENCES TimeLine(TL_ID)"));
    }

    #[test]
    fn with_output_ref_appends_without_foreign_key(base in arb_fields()) {
        let base_len = base.len();
        let (fields, fks) = schema::with_output_ref(base);
        prop_assert_eq!(fields.len(), base_len + 1);
        prop_assert_eq!(fields[base_len].name.as_str(), OUTPUT_REF);
        prop_assert!(fks.is_empty());
        prop_assert!(Table::new("T", fields, fks, vec![]).has_output_ref());
    }
}

// =============================================================================
// Registry rules
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn registry_roundtrips_registered_tables(tables in prop::collection::vec(arb_table(), 1..5)) {
        let registry = SchemaRegistry::empty();
        let mut seen = Vec::new();
        for table in tables {
            let name = table.name().to_owned();
            if seen.contains(&name) {
                continue;
            }
            registry.register(table).expect("register");
            seen.push(name);
        }
        prop_assert_eq!(registry.len(), seen.len());
        for name in &seen {
            prop_assert!(registry.contains(name));
            let table = registry.get(name).expect("get");
            prop_assert_eq!(table.name(), name.as_str());
        }
        // registration order is preserved
        let order: Vec<String> = registry
            .tables()
            .iter()
            .map(|t| t.name().to_owned())
            .collect();
        prop_assert_eq!(order, seen);
    }

    #[test]
    fn duplicate_registration_is_rejected(table in arb_table()) {
        let registry = SchemaRegistry::empty();
        registry.register(table.clone()).expect("first register");
        let err = registry.register(table).unwrap_err();
        prop_assert!(matches!(err, SchemaError::DuplicateTable(_)));
    }

    #[test]
    fn frozen_registry_rejects_registration(table in arb_table()) {
        let registry = SchemaRegistry::empty();
        registry.freeze();
        let err = registry.register(table).unwrap_err();
        prop_assert!(matches!(err, SchemaError::RegistryFrozen(_)));
    }

    #[test]
    fn two_primary_keys_are_rejected(a in arb_ident(), b in arb_ident()) {
        let table = Table::new(
            "T",
            vec![
                Field::primary_key(format!("{a}_0")),
                Field::primary_key(format!("{b}_1")),
            ],
            vec![],
            vec![],
        );
        let err = SchemaRegistry::empty().register(table).unwrap_err();
        prop_assert!(matches!(err, SchemaError::MultiplePrimaryKeys(_)));
    }
}

// =============================================================================
// Value conversions
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn integer_values_roundtrip(n in any::<i64>()) {
        let value = Value::from(n);
        prop_assert_eq!(value.as_integer(), Some(n));
        prop_assert!(!value.is_null());
    }

    #[test]
    fn text_values_roundtrip(s in ".{0,40}") {
        let value = Value::from(s.as_str());
        prop_assert_eq!(value.as_text(), Some(s.as_str()));
        prop_assert_eq!(Value::from(s.clone()), value);
    }

    #[test]
    fn real_values_keep_their_bits(x in any::<f64>().prop_filter("nan", |x| !x.is_nan())) {
        match Value::from(x) {
            Value::Real(stored) => prop_assert_eq!(stored, x),
            other => prop_assert!(false, "unexpected variant {other:?}"),
        }
    }
}
