//! End-to-end job scenarios: encode → store → run → decrypt
//!
//! Each scenario builds a small encrypted table on disk, runs one job
//! through the driver, and checks the decrypted slot-0 result against
//! the plaintext reference. Profiles are shrunk (256 slots) so the
//! whole suite runs in milliseconds, the same parameters a data owner
//! would use for a dry run.

use std::path::Path;

use tempfile::tempdir;

use cipherstat::driver::run_job;
use cipherstat::eval::Evaluator;
use cipherstat::jobs::{JobCondition, JobSpec, Operation};
use cipherstat::ops::lbc::aggregate_slots;
use cipherstat::params::Profile;
use cipherstat::schema::{Column, ColumnKind, TableMeta, TableSchema};
use cipherstat::storage::{read_result, write_result, TableStore};
use cipherstat::{encode_bbmv, encode_bmv, encode_pbmv, encode_validity, LbcConfig, StatError};

fn test_profile() -> Profile {
    Profile::custom(9, 20, 45, true).unwrap() // 256 slots, bootstrapped
}

/// Declarative table fixture: encodes columns, masks, and validity the
/// way the data-owner pipeline does.
struct TableFixture {
    name: &'static str,
    rows: usize,
    numeric: Vec<(&'static str, Vec<f64>, f64)>,
    categorical: Vec<(&'static str, Vec<u32>, usize)>,
    ordinal: Vec<(&'static str, Vec<u32>, usize)>,
    /// (primary column, secondary column, secondary target) for packed
    /// encodings.
    packed: Option<(&'static str, &'static str, u32)>,
}

impl TableFixture {
    fn build(&self, dir: &Path, profile: &Profile) -> TableStore {
        let backend = cipherstat::CkksBackend::new(profile.clone()).unwrap();

        let mut columns = Vec::new();
        for (name, _, bound) in &self.numeric {
            columns.push(Column {
                name: name.to_string(),
                kind: ColumnKind::Numerical,
                categories: 0,
                value_bound: *bound,
            });
        }
        for (name, _, categories) in &self.categorical {
            columns.push(Column {
                name: name.to_string(),
                kind: ColumnKind::Categorical,
                categories: *categories,
                value_bound: 0.0,
            });
        }
        for (name, _, categories) in &self.ordinal {
            columns.push(Column {
                name: name.to_string(),
                kind: ColumnKind::Ordinal,
                categories: *categories,
                value_bound: 0.0,
            });
        }

        let schema = TableSchema {
            name: self.name.to_string(),
            columns,
        };
        let mut meta = TableMeta::new(schema, self.rows, profile).unwrap();
        let lbc_config = self
            .packed
            .map(|_| LbcConfig::fitted(2, 1, profile.slots).unwrap());
        if let Some(config) = lbc_config {
            meta = meta.with_lbc(config);
        }
        let store = TableStore::create(dir, meta).unwrap();

        let validity = encode_validity(&vec![true; self.rows]);
        let validity_ct = backend.encrypt_values(&validity);

        for (name, values, _) in &self.numeric {
            store
                .save_block(name, 0, &backend.encrypt_values(values))
                .unwrap();
            store.save_validity(name, 0, &validity_ct).unwrap();
        }
        for (name, values, categories) in self.categorical.iter().chain(&self.ordinal) {
            store.save_validity(name, 0, &validity_ct).unwrap();
            // The raw integer coding backs lookup jobs; masks back the
            // bin and percentile jobs.
            let coded: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            store.save_block(name, 0, &backend.encrypt_values(&coded)).unwrap();
            for value in 1..=*categories as u32 {
                let mask = encode_bmv(values, value);
                store
                    .save_bmv(name, value, 0, &backend.encrypt_values(&mask))
                    .unwrap();
            }
        }

        if let Some((primary, secondary, target)) = self.packed {
            let config = lbc_config.unwrap();
            let primary_values = &self.categorical.iter().find(|c| c.0 == primary).unwrap().1;
            let secondary_values = &self.categorical.iter().find(|c| c.0 == secondary).unwrap().1;
            let pbmv = encode_pbmv(primary_values, 2, &config);
            let bbmv = encode_bbmv(secondary_values, target, &config);
            store
                .save_pbmv(primary, 0, &backend.encrypt_values(&pbmv))
                .unwrap();
            store
                .save_bbmv(secondary, 0, &backend.encrypt_values(&bbmv))
                .unwrap();
        }

        store
    }
}

fn job(id: &str, op: Operation, table: &str) -> JobSpec {
    JobSpec {
        id: id.into(),
        op,
        table: table.into(),
        input_columns: vec![],
        target_column: None,
        conditions: vec![],
        k: None,
        lookup_value: None,
    }
}

#[test]
fn mean_of_an_income_column() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let fixture = TableFixture {
        name: "incomes",
        rows: 5,
        numeric: vec![(
            "income",
            vec![100.0, 200.0, 300.0, 400.0, 500.0],
            1000.0,
        )],
        categorical: vec![],
        ordinal: vec![],
        packed: None,
    };
    let store = fixture.build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("mean-1", Operation::Mean, "incomes");
    spec.input_columns = vec!["income".into()];

    let outcome = run_job(&eval, &store, &spec).unwrap();
    let got = eval.backend().decrypt(&outcome.result)[0];
    assert!((got - 300.0).abs() < 0.01, "mean decrypted as {got}");

    // The sidecar round-trips through the result directory.
    let out_dir = dir.path().join("out");
    write_result(&out_dir, &spec.id, spec.op.as_str(), &outcome.result, outcome.counters).unwrap();
    let (_, sidecar) = read_result(&out_dir).unwrap();
    assert_eq!(sidecar.job_id, "mean-1");
    assert!(sidecar.operation_counts.mul_count > 0);
    assert!(sidecar.operation_counts.rotate_count > 0);
}

#[test]
fn correlation_of_proportional_columns() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let fixture = TableFixture {
        name: "pairs",
        rows: 6,
        numeric: vec![
            ("x", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 8.0),
            ("y", vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0], 16.0),
        ],
        categorical: vec![],
        ordinal: vec![],
        packed: None,
    };
    let store = fixture.build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("corr-1", Operation::Corr, "pairs");
    spec.input_columns = vec!["x".into(), "y".into()];

    let outcome = run_job(&eval, &store, &spec).unwrap();
    let got = eval.backend().decrypt(&outcome.result)[0];
    assert!((got - 1.0).abs() < 0.01, "correlation decrypted as {got}");
}

fn survey_fixture() -> TableFixture {
    TableFixture {
        name: "survey",
        rows: 6,
        numeric: vec![],
        categorical: vec![
            ("gender", vec![1, 2, 1, 2, 1, 2], 2),
            ("region", vec![1, 2, 3, 2, 1, 2], 3),
        ],
        ordinal: vec![],
        packed: None,
    }
}

#[test]
fn bin_count_over_two_conditions() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let store = survey_fixture().build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("bc-1", Operation::Bc, "survey");
    spec.conditions = vec![
        JobCondition {
            column: "gender".into(),
            value: 2,
        },
        JobCondition {
            column: "region".into(),
            value: 2,
        },
    ];

    let outcome = run_job(&eval, &store, &spec).unwrap();
    let got = eval.backend().decrypt(&outcome.result)[0];
    assert!((got - 3.0).abs() < 0.01, "bin count decrypted as {got}");
}

#[test]
fn bin_average_of_a_masked_subpopulation() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let fixture = TableFixture {
        name: "salaries",
        rows: 5,
        numeric: vec![(
            "income",
            vec![100.0, 200.0, 300.0, 400.0, 500.0],
            1000.0,
        )],
        categorical: vec![("gender", vec![1, 2, 1, 2, 1], 2)],
        ordinal: vec![],
        packed: None,
    };
    let store = fixture.build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("ba-1", Operation::Ba, "salaries");
    spec.target_column = Some("income".into());
    spec.conditions = vec![JobCondition {
        column: "gender".into(),
        value: 1,
    }];

    let outcome = run_job(&eval, &store, &spec).unwrap();
    let got = eval.backend().decrypt(&outcome.result)[0];
    assert!((got - 300.0).abs() < 1.0, "bin average decrypted as {got}");
}

#[test]
fn ninetieth_percentile_of_an_ordinal_column() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let fixture = TableFixture {
        name: "grades",
        rows: 20,
        numeric: vec![],
        categorical: vec![],
        ordinal: vec![(
            "grade",
            vec![3, 2, 4, 2, 3, 1, 5, 2, 3, 1, 4, 2, 3, 1, 5, 2, 3, 1, 4, 2],
            5,
        )],
        packed: None,
    };
    let store = fixture.build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("pct-1", Operation::Percentile, "grades");
    spec.input_columns = vec!["grade".into()];
    spec.k = Some(90.0);

    let outcome = run_job(&eval, &store, &spec).unwrap();
    let got = eval.backend().decrypt(&outcome.result)[0];
    assert!((got - 5.0).abs() < 0.1, "percentile bucket decrypted as {got}");
}

#[test]
fn packed_contingency_table_round_trips() {
    let profile = test_profile();
    let primary = vec![1u32, 2, 1, 1, 2, 2, 1, 2, 1, 1, 2, 1, 2, 2, 1, 2];
    let secondary = vec![1u32, 1, 2, 1, 2, 1, 1, 2, 2, 1, 1, 1, 2, 2, 1, 1];

    let mut expected = [[0u64; 2]; 2]; // [target-1][primary-1]
    for (p, s) in primary.iter().zip(&secondary) {
        expected[*s as usize - 1][*p as usize - 1] += 1;
    }

    // One engine pass per secondary target value rebuilds the full 2×2.
    for target in 1..=2u32 {
        let dir = tempdir().unwrap();
        let fixture = TableFixture {
            name: "panel",
            rows: 16,
            numeric: vec![],
            categorical: vec![
                ("gender", primary.clone(), 2),
                ("smoker", secondary.clone(), 2),
            ],
            ordinal: vec![],
            packed: Some(("gender", "smoker", target)),
        };
        let store = fixture.build(dir.path(), &profile);
        let eval = Evaluator::new(profile.clone()).unwrap();

        let mut spec = job("lbc-1", Operation::Lbc, "panel");
        spec.input_columns = vec!["gender".into(), "smoker".into()];

        let outcome = run_job(&eval, &store, &spec).unwrap();
        let plan = outcome.lbc_plan.expect("packed jobs report a plan");
        assert!(!plan.requires_aggregation);

        let decrypted = eval.backend().decrypt(&outcome.result);
        let cells = aggregate_slots(&plan, &decrypted).unwrap();
        assert_eq!(cells, expected[target as usize - 1]);
    }
}

#[test]
fn sum_of_rows_matching_a_lookup_value() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let fixture = TableFixture {
        name: "salaries",
        rows: 5,
        numeric: vec![(
            "income",
            vec![100.0, 200.0, 300.0, 400.0, 500.0],
            1000.0,
        )],
        categorical: vec![("gender", vec![1, 2, 1, 2, 1], 2)],
        ordinal: vec![],
        packed: None,
    };
    let store = fixture.build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("lookup-1", Operation::Lookup, "salaries");
    spec.input_columns = vec!["gender".into()];
    spec.target_column = Some("income".into());
    spec.lookup_value = Some(2);

    let outcome = run_job(&eval, &store, &spec).unwrap();
    let got = eval.backend().decrypt(&outcome.result)[0];
    assert!((got - 600.0).abs() < 1.0, "lookup sum decrypted as {got}");
}

#[test]
fn mismatched_parameters_are_rejected_before_any_work() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let fixture = TableFixture {
        name: "incomes",
        rows: 5,
        numeric: vec![("income", vec![1.0, 2.0, 3.0, 4.0, 5.0], 8.0)],
        categorical: vec![],
        ordinal: vec![],
        packed: None,
    };
    let store = fixture.build(dir.path(), &profile);

    // Evaluator under a different parameter set.
    let other = Evaluator::new(Profile::custom(9, 18, 45, true).unwrap()).unwrap();
    let mut spec = job("mean-x", Operation::Mean, "incomes");
    spec.input_columns = vec!["income".into()];

    let err = run_job(&other, &store, &spec);
    assert!(matches!(err, Err(StatError::InvalidConfiguration { .. })));
}

#[test]
fn unknown_columns_are_rejected_before_any_work() {
    let dir = tempdir().unwrap();
    let profile = test_profile();
    let store = survey_fixture().build(dir.path(), &profile);
    let eval = Evaluator::new(profile).unwrap();

    let mut spec = job("bc-x", Operation::Bc, "survey");
    spec.conditions = vec![JobCondition {
        column: "age_band".into(),
        value: 1,
    }];

    let err = run_job(&eval, &store, &spec);
    assert!(matches!(err, Err(StatError::InvalidConfiguration { .. })));
}
