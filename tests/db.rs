use rellite::error::RelLiteError;
use rellite::index::{Circle, Rect};
use rellite::query::{Condition, DeleteQuery, SelectQuery, SortOrder};
use rellite::schema::{DataType, IndexType, TableSchema, TableSchemaBuilder, Value};
use rellite::Database;
use rellite::Result;
use rand::prelude::*;
use tempfile::TempDir;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn people_schema() -> TableSchema {
    TableSchemaBuilder::new("p")
        .column("id", DataType::Int, |c| {
            c.is_primary = true;
            c.index_type = IndexType::Btree;
        })
        .column("name", DataType::Varchar, |c| c.varchar_length = 10)
        .build()
}

fn person(id: i32, name: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Varchar(name.into())]
}

fn int_values(records: &[Vec<Value>], idx: usize) -> Vec<i32> {
    records
        .iter()
        .map(|r| match &r[idx] {
            Value::Int(v) => *v,
            other => panic!("expected INT, got {:?}", other),
        })
        .collect()
}

#[test]
fn test_select_order_by() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    for (id, name) in [(3, "c"), (1, "a"), (4, "d"), (2, "b")] {
        db.insert("p", person(id, name))?;
    }

    let result = db.select(&SelectQuery::new("p").order_by("id", SortOrder::Asc))?;
    assert_eq!(result.columns, vec!["id", "name"]);
    assert_eq!(
        result.records,
        vec![
            person(1, "a"),
            person(2, "b"),
            person(3, "c"),
            person(4, "d"),
        ]
    );
    Ok(())
}

#[test]
fn test_select_between_with_projection() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    for (id, name) in [(3, "c"), (1, "a"), (4, "d"), (2, "b")] {
        db.insert("p", person(id, name))?;
    }

    let query = SelectQuery::new("p")
        .with_condition(Condition::between("id", Value::Int(2), Value::Int(3)))
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    let result = db.select(&query)?;
    assert_eq!(result.columns, vec!["id"]);
    assert_eq!(result.records, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    Ok(())
}

#[test]
fn test_every_index_type_round_trips_100_rows() -> Result<()> {
    init_logger();
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;

    let mut builder = TableSchemaBuilder::new("mix").column("id", DataType::Int, |c| {
        c.is_primary = true;
        c.index_type = IndexType::Btree;
    });
    let indexes = [
        IndexType::Btree,
        IndexType::Avl,
        IndexType::Hash,
        IndexType::Isam,
    ];
    let types = [DataType::Int, DataType::Float, DataType::Varchar];
    let mut n = 0;
    for index_type in indexes {
        for data_type in types {
            n += 1;
            builder = builder.column(format!("col{}", n), data_type, |c| {
                c.index_type = index_type;
                if data_type == DataType::Varchar {
                    c.varchar_length = 10;
                }
            });
        }
    }
    let builder = builder.column("coord", DataType::Point, |c| c.index_type = IndexType::Rtree);
    db.create_table(builder.build())?;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut rows = Vec::new();
    for id in 0..100 {
        let mut row = vec![Value::Int(id)];
        for _ in indexes.iter() {
            for data_type in types {
                row.push(match data_type {
                    DataType::Int => Value::Int(rng.gen_range(0..1000)),
                    DataType::Float => Value::Float(rng.gen_range(0.0..1.0)),
                    DataType::Varchar => {
                        let s: String = (0..10)
                            .map(|_| rng.gen_range(b'a'..=b'z') as char)
                            .collect();
                        Value::Varchar(s)
                    }
                    _ => unreachable!(),
                });
            }
        }
        row.push(Value::Point(
            rng.gen_range(-50.0..50.0),
            rng.gen_range(-50.0..50.0),
        ));
        rows.push(row);
    }
    for row in &rows {
        db.insert("mix", row.clone())?;
    }

    let result = db.select(&SelectQuery::new("mix"))?;
    assert_eq!(result.records.len(), 100);
    // no condition means heap order, which is insertion order here
    assert_eq!(result.records, rows);
    Ok(())
}

#[test]
fn test_delete_frees_slot_for_next_insert() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    db.insert("p", person(5, "x"))?;
    let freed = db.insert("p", person(6, "y"))?;
    db.insert("p", person(7, "z"))?;
    db.insert("p", person(9, "v"))?;

    let removed = db.delete(
        &DeleteQuery::new("p").with_condition(Condition::eq("id", Value::Int(6))),
    )?;
    assert_eq!(removed, 1);

    // the LIFO free list hands back the slot id 6 occupied
    let reused = db.insert("p", person(8, "w"))?;
    assert_eq!(reused, freed);

    let result = db.select(&SelectQuery::new("p").order_by("id", SortOrder::Asc))?;
    assert_eq!(int_values(&result.records, 0), vec![5, 7, 8, 9]);
    Ok(())
}

#[test]
fn test_create_index_backfills_and_drop_restores() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    for id in 0..1000 {
        db.insert("p", person(id, &format!("n{}", id % 37)))?;
    }

    db.create_index("p", "i", &["name"], IndexType::Hash)?;
    assert_eq!(
        db.table_schema("p")?.columns[1].index_type,
        IndexType::Hash
    );

    let query = SelectQuery::new("p")
        .with_condition(Condition::eq("name", Value::Varchar("n5".into())));
    let result = db.select(&query)?;
    assert_eq!(result.records.len(), 27); // ids 5, 42, 79, ... under 1000

    let err = db
        .select(
            &SelectQuery::new("p")
                .with_condition(Condition::gt("name", Value::Varchar("n5".into()))),
        )
        .unwrap_err();
    assert!(matches!(err, RelLiteError::UnsupportedOperation { .. }));

    db.drop_index("p", "i")?;
    let schema = db.table_schema("p")?;
    assert_eq!(schema.columns[1].index_type, IndexType::None);
    assert_eq!(schema.columns[1].index_name, None);

    // back to heap scans: both equality and ranges work again
    let result = db.select(&query)?;
    assert_eq!(result.records.len(), 27);
    assert!(db.drop_index("p", "i").is_err());
    Ok(())
}

#[test]
fn test_spatial_queries() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(
        TableSchemaBuilder::new("sites")
            .column("id", DataType::Int, |c| {
                c.is_primary = true;
                c.index_type = IndexType::Btree;
            })
            .column("coord", DataType::Point, |c| c.index_type = IndexType::Rtree)
            .build(),
    )?;
    let points = [(10.0, 20.0), (5.5, 5.5), (15.0, 15.0), (12.0, 22.0)];
    for (i, (x, y)) in points.iter().enumerate() {
        db.insert(
            "sites",
            vec![Value::Int(i as i32 + 1), Value::Point(*x, *y)],
        )?;
    }

    let rect = SelectQuery::new("sites")
        .with_condition(Condition::within_rect("coord", Rect::new(9.0, 19.0, 13.0, 23.0)))
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    assert_eq!(int_values(&db.select(&rect)?.records, 0), vec![1, 4]);

    let circle = SelectQuery::new("sites")
        .with_condition(Condition::within_circle("coord", Circle::new(6.0, 6.0, 2.0)))
        .select_columns(&["id"]);
    assert_eq!(int_values(&db.select(&circle)?.records, 0), vec![2]);

    let knn = SelectQuery::new("sites")
        .with_condition(Condition::knn("coord", 11.0, 21.0, 2))
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    assert_eq!(int_values(&db.select(&knn)?.records, 0), vec![1, 4]);
    Ok(())
}

#[test]
fn test_drop_table_is_not_idempotent() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    db.insert("p", person(1, "a"))?;
    db.drop_table("p")?;
    assert_eq!(
        db.drop_table("p").unwrap_err(),
        RelLiteError::TableMissing("p".into())
    );

    // create/drop/create leaves an empty table behind
    db.create_table(people_schema())?;
    assert_eq!(db.select(&SelectQuery::new("p"))?.records.len(), 0);
    Ok(())
}

#[test]
fn test_schema_and_type_errors() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    assert_eq!(
        db.create_table(people_schema()).unwrap_err(),
        RelLiteError::TableExists("p".into())
    );

    assert!(matches!(
        db.insert("p", vec![Value::Int(1)]),
        Err(RelLiteError::InvalidSchema(_))
    ));
    assert!(matches!(
        db.insert("p", vec![Value::Bool(true), Value::Varchar("a".into())]),
        Err(RelLiteError::TypeMismatch { .. })
    ));
    assert!(matches!(
        db.insert("p", person(1, "name too long for ten")),
        Err(RelLiteError::VarcharOverflow { .. })
    ));
    assert!(matches!(
        db.select(&SelectQuery::new("p").select_columns(&["ghost"])),
        Err(RelLiteError::ColumnMissing(_))
    ));
    assert!(matches!(
        db.create_index("p", "i", &["id", "name"], IndexType::Hash),
        Err(RelLiteError::MultiColumnIndex)
    ));
    assert!(matches!(
        db.create_index("p", "i", &["id"], IndexType::Hash),
        Err(RelLiteError::ColumnAlreadyIndexed(_))
    ));
    Ok(())
}

#[test]
fn test_insert_with_columns_reorders() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    db.insert_with_columns(
        "p",
        &["name", "id"],
        vec![Value::Varchar("ana".into()), Value::Int(7)],
    )?;
    let result = db.select(&SelectQuery::new("p"))?;
    assert_eq!(result.records, vec![person(7, "ana")]);
    Ok(())
}

#[test]
fn test_negation_and_disjunction() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    for id in 0..10 {
        db.insert("p", person(id, "x"))?;
    }

    let not_three = SelectQuery::new("p")
        .with_condition(Condition::eq("id", Value::Int(3)).not())
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    assert_eq!(
        int_values(&db.select(&not_three)?.records, 0),
        vec![0, 1, 2, 4, 5, 6, 7, 8, 9]
    );

    let edges = SelectQuery::new("p")
        .with_condition(
            Condition::lt("id", Value::Int(2)).or(Condition::ge("id", Value::Int(8))),
        )
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    assert_eq!(int_values(&db.select(&edges)?.records, 0), vec![0, 1, 8, 9]);

    // NOT over NOT round-trips through the tail flag
    let double = SelectQuery::new("p")
        .with_condition(Condition::eq("id", Value::Int(3)).not().not())
        .select_columns(&["id"]);
    assert_eq!(int_values(&db.select(&double)?.records, 0), vec![3]);
    Ok(())
}

#[test]
fn test_order_by_desc_with_limit() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(people_schema())?;
    for id in 0..50 {
        db.insert("p", person(id, "x"))?;
    }

    let top = SelectQuery::new("p")
        .order_by("id", SortOrder::Desc)
        .select_columns(&["id"])
        .limit(5);
    assert_eq!(
        int_values(&db.select(&top)?.records, 0),
        vec![49, 48, 47, 46, 45]
    );

    // limit above n/2 exercises the full-sort path
    let most = SelectQuery::new("p")
        .order_by("id", SortOrder::Asc)
        .limit(40);
    assert_eq!(db.select(&most)?.records.len(), 40);
    Ok(())
}

#[test]
fn test_bool_column_shorthand() -> Result<()> {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(
        TableSchemaBuilder::new("flags")
            .column("id", DataType::Int, |c| {
                c.is_primary = true;
                c.index_type = IndexType::Avl;
            })
            .column("active", DataType::Bool, |_| {})
            .build(),
    )?;
    for id in 0..6 {
        db.insert(
            "flags",
            vec![Value::Int(id), Value::Bool(id % 2 == 0)],
        )?;
    }

    let active = SelectQuery::new("flags")
        .with_condition(Condition::BoolColumn("active".into()))
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    assert_eq!(int_values(&db.select(&active)?.records, 0), vec![0, 2, 4]);
    Ok(())
}

#[test]
fn test_index_faithfulness_after_churn() -> Result<()> {
    init_logger();
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let db = Database::open(temp_dir.path())?;
    db.create_table(
        TableSchemaBuilder::new("churn")
            .column("id", DataType::Int, |c| {
                c.is_primary = true;
                c.index_type = IndexType::Avl;
            })
            .column("grp", DataType::Int, |c| c.index_type = IndexType::Btree)
            .build(),
    )?;

    for id in 0..60 {
        db.insert("churn", vec![Value::Int(id), Value::Int(id % 4)])?;
    }
    db.delete(&DeleteQuery::new("churn").with_condition(Condition::eq("grp", Value::Int(1))))?;
    for id in 60..75 {
        db.insert("churn", vec![Value::Int(id), Value::Int(9)])?;
    }

    let by_group = SelectQuery::new("churn")
        .with_condition(Condition::eq("grp", Value::Int(9)))
        .select_columns(&["id"])
        .order_by("id", SortOrder::Asc);
    assert_eq!(
        int_values(&db.select(&by_group)?.records, 0),
        (60..75).collect::<Vec<i32>>()
    );

    let gone = SelectQuery::new("churn")
        .with_condition(Condition::eq("grp", Value::Int(1)));
    assert_eq!(db.select(&gone)?.records.len(), 0);

    let all = db.select(&SelectQuery::new("churn"))?;
    assert_eq!(all.records.len(), 60); // 60 - 15 deleted + 15 inserted
    Ok(())
}
