//! Cross-instance execution: two tabletized PEMs stream partial aggregates
//! into one Kelvin over in-process bridges.

use carnot::ast::builders::*;
use carnot::plan::{
    DagNodePb, DagPb, DistributedPlanPb, OperatorPb, PlanFragmentPb, PlanNodePb, PlanPb,
};
use carnot::planner::TableInfo;
use carnot::types::arrow_adapter::{column_wrapper_from_array, column_wrapper_to_array};
use carnot::types::ColumnWrapper;
use carnot::{
    Carnot, CarnotError, CarnotInfo, Config, DataType, ExecError, Registry, Relation, Table,
    TableStore,
};
use std::collections::HashMap;
use std::sync::Arc;

fn table_relation() -> Relation {
    Relation::from_columns(vec![
        ("time_", DataType::Time64Ns),
        ("cpu", DataType::Int64),
        ("upid", DataType::Uint128),
    ])
}

/// A PEM store with one tablet per upid shard.
fn pem_store(shards: Vec<(&str, Vec<u128>)>) -> Arc<TableStore> {
    let store = Arc::new(TableStore::new());
    store.add_table("t", Arc::new(Table::new(table_relation())));
    for (tablet, upids) in shards {
        let table = store.create_tablet("t", tablet).unwrap();
        let n = upids.len();
        table
            .append_record_batch(vec![
                column_wrapper_to_array(&ColumnWrapper::Time64Ns((0..n as i64).collect())),
                column_wrapper_to_array(&ColumnWrapper::Int64(vec![1; n])),
                column_wrapper_to_array(&ColumnWrapper::Uint128(upids)),
            ])
            .unwrap();
    }
    store
}

fn tabletized_pem(address: &str, asid: u32) -> CarnotInfo {
    let mut info = CarnotInfo::pem(address, asid);
    info.table_info.push(TableInfo {
        table: "t".to_string(),
        tabletization_key: Some("upid".to_string()),
        tablets: vec!["1".to_string(), "2".to_string()],
    });
    info
}

fn groupby_count_ast() -> carnot::ast::AstModule {
    module(vec![
        assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
        assign(
            name("df"),
            call(
                attribute(
                    call(attribute(name("df"), "groupby"), vec![str_lit("upid")], vec![]),
                    "agg",
                ),
                vec![],
                vec![("n", tuple(vec![str_lit("cpu"), name("count")]))],
            ),
        ),
        expr_stmt(call(name("display"), vec![name("df"), str_lit("out")], vec![])),
    ])
}

#[test]
fn test_two_pems_one_kelvin_count() {
    // Compilation sees the table schema through the engine's own store.
    let engine_store = Arc::new(TableStore::new());
    engine_store.add_table("t", Arc::new(Table::new(table_relation())));
    let engine = Carnot::new(
        Config::default(),
        engine_store,
        Arc::new(Registry::with_builtins()),
    );

    let graph = engine.compile(&groupby_count_ast(), 0).unwrap();
    let infos = vec![
        tabletized_pem("pem1", 1),
        tabletized_pem("pem2", 2),
        CarnotInfo::kelvin("kelvin", "kelvin:59300", 3),
    ];
    let (_, plan) = engine.plan(&graph, &infos).unwrap();

    // upid 100 has 3 rows on pem1 + 1 on pem2; upid 200 has 1 + 3.
    let mut stores: HashMap<String, Arc<TableStore>> = HashMap::new();
    stores.insert(
        "pem1".to_string(),
        pem_store(vec![("1", vec![100, 100, 100]), ("2", vec![200])]),
    );
    stores.insert(
        "pem2".to_string(),
        pem_store(vec![("1", vec![100]), ("2", vec![200, 200, 200])]),
    );
    stores.insert("kelvin".to_string(), Arc::new(TableStore::new()));

    let result = engine.execute_distributed(&plan, &stores).unwrap();

    assert_eq!(result.output_tables.len(), 1);
    let (sink_name, table) = &result.output_tables[0];
    assert_eq!(sink_name, "out");
    assert_eq!(table.relation().col_names(), vec!["upid", "n"]);

    // Collect (upid, count) pairs across output batches.
    let mut rows: Vec<(u128, i64)> = Vec::new();
    for batch_idx in 0..table.num_batches() {
        let rb = table.row_batch(batch_idx, &[0, 1]).unwrap();
        let upids = match column_wrapper_from_array(rb.column(0)).unwrap() {
            ColumnWrapper::Uint128(v) => v,
            _ => panic!("expected UINT128 group keys"),
        };
        let counts = match column_wrapper_from_array(rb.column(1)).unwrap() {
            ColumnWrapper::Int64(v) => v,
            _ => panic!("expected INT64 counts"),
        };
        rows.extend(upids.into_iter().zip(counts));
    }
    rows.sort();
    assert_eq!(rows, vec![(100, 4), (200, 4)]);
}

#[test]
fn test_query_timeout_on_stalled_source() {
    // A GRPC source whose bridge nobody ever feeds blocks until the
    // configured deadline expires.
    let mut config = Config::default();
    config.execution.query_timeout_ms = 50;
    let engine = Carnot::new(
        config,
        Arc::new(TableStore::new()),
        Arc::new(Registry::with_builtins()),
    );

    let stalled = PlanPb {
        dag: DagPb {
            nodes: vec![DagNodePb { id: 1, sorted_children: vec![], sorted_parents: vec![] }],
        },
        nodes: vec![PlanFragmentPb {
            id: 1,
            dag: DagPb {
                nodes: vec![
                    DagNodePb { id: 1, sorted_children: vec![2], sorted_parents: vec![] },
                    DagNodePb { id: 2, sorted_children: vec![], sorted_parents: vec![1] },
                ],
            },
            nodes: vec![
                PlanNodePb {
                    id: 1,
                    op: OperatorPb::GrpcSource {
                        source_id: 7,
                        column_names: vec!["v".to_string()],
                        column_types: vec![DataType::Int64],
                    },
                },
                PlanNodePb {
                    id: 2,
                    op: OperatorPb::MemorySink {
                        name: "out".to_string(),
                        column_names: vec!["v".to_string()],
                        column_types: vec![DataType::Int64],
                    },
                },
            ],
        }],
    };
    let mut plan = DistributedPlanPb::default();
    plan.qb_address_to_plan.insert("kelvin".to_string(), stalled);
    plan.qb_address_to_dag_id.insert("kelvin".to_string(), 0);
    plan.dag.nodes.push(DagNodePb { id: 0, sorted_children: vec![], sorted_parents: vec![] });

    let err = engine.execute_distributed(&plan, &HashMap::new()).unwrap_err();
    assert!(matches!(err, CarnotError::Exec(ExecError::QueryTimeout)));
}

#[test]
fn test_select_all_streams_pem_to_kelvin() {
    let engine_store = Arc::new(TableStore::new());
    engine_store.add_table("t", Arc::new(Table::new(table_relation())));
    let engine = Carnot::new(
        Config::default(),
        engine_store,
        Arc::new(Registry::with_builtins()),
    );

    let ast = module(vec![
        assign(name("df"), call(name("DataFrame"), vec![str_lit("t")], vec![])),
        expr_stmt(call(name("display"), vec![name("df"), str_lit("out")], vec![])),
    ]);
    let graph = engine.compile(&ast, 0).unwrap();
    let infos = vec![
        CarnotInfo::pem("pem1", 1),
        CarnotInfo::kelvin("kelvin", "kelvin:59300", 2),
    ];
    let (_, plan) = engine.plan(&graph, &infos).unwrap();

    let pem1 = Arc::new(TableStore::new());
    pem1.add_table("t", Arc::new(Table::new(table_relation())));
    pem1.get_table("t")
        .unwrap()
        .append_record_batch(vec![
            column_wrapper_to_array(&ColumnWrapper::Time64Ns(vec![1, 2])),
            column_wrapper_to_array(&ColumnWrapper::Int64(vec![7, 8])),
            column_wrapper_to_array(&ColumnWrapper::Uint128(vec![5, 5])),
        ])
        .unwrap();

    let mut stores = HashMap::new();
    stores.insert("pem1".to_string(), pem1);
    stores.insert("kelvin".to_string(), Arc::new(TableStore::new()));

    let result = engine.execute_distributed(&plan, &stores).unwrap();
    let (_, table) = &result.output_tables[0];
    // The kelvin's sink holds the streamed rows.
    assert_eq!(table.num_rows(), 2);
    assert_eq!(result.rows_processed, 2);
}
