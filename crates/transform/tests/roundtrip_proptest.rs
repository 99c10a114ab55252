//! Property test for spec §8 invariant 5: transforming `A -> B` and then
//! `B -> A'` with a fresh `RemapContext` each time must reproduce `A`'s
//! structure in `A'`. Ids are expected to differ (that's the whole point of
//! a transform), so the comparison walks the parent-chain by `CodeValue`
//! rather than by raw id -- which is exactly what it means for the
//! forward/reverse id mapping to be a bijection rather than merely
//! count-preserving.

mod common;

use std::path::Path;

use ecdb_transform::{
    config::TransformConfig,
    Cloner,
    Orchestrator,
    TransformReport,
};
use proptest::prelude::*;
use rusqlite::Connection;

fn open_db_file() -> (tempfile::NamedTempFile, Connection) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let conn = Connection::open(file.path()).unwrap();
    (file, conn)
}

fn insert_chain(conn: &Connection, chain_len: usize) {
    let mut parent = ecdb_transform::ids::Id::ROOT_SUBJECT.0;
    for i in 0..chain_len {
        let id = 0x20 + i as u64;
        common::insert_element(conn, id, &format!("E{i}"), parent);
        parent = id;
    }
}

fn run_transform(source_path: &Path, source: Connection, target: Connection) -> TransformReport {
    let catalog = common::catalog();
    let plans = common::class_plans(&catalog);
    let mut orchestrator = Orchestrator::new(
        source,
        target,
        source_path.to_str().unwrap(),
        catalog,
        Cloner::new(),
        TransformConfig::default(),
        false,
    )
    .unwrap();
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    rt.block_on(orchestrator.run(&plans)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn transform_and_its_reverse_preserve_parent_chain_structure(chain_len in 1usize..=6) {
        let (a_file, a) = open_db_file();
        common::bootstrap_source(&a);
        insert_chain(&a, chain_len);

        let (b_file, b) = open_db_file();
        common::bootstrap_target(&b);

        let forward = run_transform(a_file.path(), a, b);
        prop_assert_eq!(forward.elements_copied, chain_len as u64);

        // B becomes the reverse leg's source: its schema was already written
        // by `bootstrap_target` during the forward leg, so it is reopened
        // as-is rather than re-bootstrapped.
        let b_as_source = Connection::open(b_file.path()).unwrap();

        let (a_prime_file, a_prime) = open_db_file();
        common::bootstrap_source(&a_prime);

        let reverse = run_transform(b_file.path(), b_as_source, a_prime);
        prop_assert_eq!(reverse.elements_copied, chain_len as u64);

        let a_conn = Connection::open(a_file.path()).unwrap();
        let a_prime_conn = Connection::open(a_prime_file.path()).unwrap();
        prop_assert_eq!(
            common::parent_graph_by_code_value(&a_conn),
            common::parent_graph_by_code_value(&a_prime_conn)
        );
    }
}
