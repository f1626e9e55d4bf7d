use enricher_core::config::AppConfig;
use enricher_core::error::ErrorClass;
use enricher_core::models::{Classification, Provenance};
use enricher_core::pipeline::{self, CancelFlag, RunMode};
use enricher_core::query::QueryService;
use enricher_core::reconciler::ChangeReason;
use enricher_core::registry::Registry;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const HEADER: &str =
    "id,name,domain,raw_text_ref,classification,confidence,topical_tags,provenance,last_updated";

fn setup(dir: &Path, rows: &[&str], texts: &[(&str, &str)]) -> AppConfig {
    let mut csv = String::from(HEADER);
    for row in rows {
        csv.push('\n');
        csv.push_str(row);
    }
    csv.push('\n');
    fs::write(dir.join("registry.csv"), csv).unwrap();
    fs::create_dir_all(dir.join("texts")).unwrap();
    for (name, body) in texts {
        fs::write(dir.join("texts").join(name), body).unwrap();
    }

    let mut cfg = AppConfig::default();
    cfg.registry.path = dir.join("registry.csv").to_string_lossy().into_owned();
    cfg.registry.text_dir = Some(dir.join("texts").to_string_lossy().into_owned());
    cfg.database.path = dir.join("enricher.db").to_string_lossy().into_owned();
    cfg.reduction.seed = Some(42);
    cfg.embeddings.dimension = 128;
    cfg
}

fn reload(cfg: &AppConfig) -> Registry {
    Registry::load(&cfg.registry.path).unwrap()
}

async fn change_count(cfg: &AppConfig) -> i64 {
    let pool = storage::connect(&cfg.database.path).await.unwrap();
    storage::changes::count_changes(&pool).await.unwrap()
}

#[tokio::test]
async fn manual_government_source_is_left_alone() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &["cbp,U.S. Customs and Border Protection,https://www.cbp.gov/newsroom,cbp.txt,government,1.0,trade,manual,2024-03-01T12:00:00Z"],
        &[("cbp.txt", "Official releases from cbp.gov on border enforcement and trade.")],
    );

    let report = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.changed, 0);
    assert!(report.pending.is_empty());

    let reg = reload(&cfg);
    let cbp = reg.get("cbp").unwrap();
    assert_eq!(cbp.classification, Classification::Government);
    assert_eq!(cbp.provenance, Provenance::Manual);
    assert_eq!(cbp.domain.as_deref(), Some("cbp.gov"));
    assert!(cbp.topical_tags.contains("trade"));
    assert_eq!(change_count(&cfg).await, 0);
}

#[tokio::test]
async fn near_duplicate_inherits_manual_label() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &[
            "alpha,Alpha Collective,alpha.example,alpha.txt,non-profit,1.0,,manual,2024-01-01T00:00:00Z",
            "beta,Beta Collective,beta.example,beta.txt,,,,,",
        ],
        &[
            ("alpha.txt", "Volunteers run community gardens, food banks and tenant clinics across the city."),
            ("beta.txt", "Volunteers run community gardens, food banks and tenant clinics across the city!"),
        ],
    );

    let report = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.changed, 1);
    let entry = &report.changes[0];
    assert_eq!(entry.source_id, "beta");
    assert_eq!(entry.reason, ChangeReason::Inferred);
    assert_eq!(entry.old_label, Classification::Unknown);
    assert_eq!(entry.new_label, Classification::NonProfit);

    let reg = reload(&cfg);
    let beta = reg.get("beta").unwrap();
    assert_eq!(beta.classification, Classification::NonProfit);
    assert_eq!(beta.provenance, Provenance::Inferred);
    // neighbour and cluster votes agree
    assert!((beta.confidence - 1.0).abs() < 1e-6);
    assert_eq!(reg.get("alpha").unwrap().classification, Classification::NonProfit);

    let pool = storage::connect(&cfg.database.path).await.unwrap();
    let logged = storage::changes::list_changes(&pool, Some("beta"), 10).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].new_label, "non-profit");
    assert_eq!(logged[0].run_id, report.run_id);
}

#[tokio::test]
async fn empty_text_leaves_source_pending() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &[
            "wire,Metro Wire,metrowire.example,wire.txt,for-profit,0.8,local,inferred,2024-05-05T05:05:05Z",
            "ok,Harbor Daily,harbordaily.example,ok.txt,,,,,",
        ],
        &[("wire.txt", "  \n\n "), ("ok.txt", "Port traffic, shipping schedules and harbor news.")],
    );
    let before = reload(&cfg).get("wire").cloned().unwrap();

    let report = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.pending.len(), 1);
    assert_eq!(report.pending[0].source_id, "wire");
    assert_eq!(report.pending[0].error_class, ErrorClass::Input);
    assert!(report.pending[0].message.contains("empty"));

    assert_eq!(reload(&cfg).get("wire"), Some(&before));

    let pool = storage::connect(&cfg.database.path).await.unwrap();
    let pending = storage::pending::list_pending(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_id, "wire");
    assert_eq!(pending[0].error_class, "input");

    // the source is retried once its text is fixed
    fs::write(temp.path().join("texts").join("wire.txt"), "Breaking metro news wire.").unwrap();
    let again = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert!(again.pending.is_empty());
    assert!(storage::pending::list_pending(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_runs_are_idempotent() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &[
            "np,Open Data Institute,opendata.example,np.txt,non-profit,1.0,,manual,2024-01-01T00:00:00Z",
            "np2,Civic Data Project,civicdata.example,np2.txt,,,,,",
            "fp,Market Times,markettimes.example,fp.txt,,,,,",
            "gov,Treasury Department,treasury.gov,gov.txt,,,,,",
        ],
        &[
            ("np.txt", "Open datasets, transparency research and public data literacy."),
            ("np2.txt", "Open datasets and transparency research for public data literacy."),
            ("fp.txt", "Stock prices, earnings calls and market moving headlines."),
            ("gov.txt", "Federal budget, debt issuance and fiscal service notices."),
        ],
    );

    let first = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert!(first.changed > 0);
    let logged = change_count(&cfg).await;
    let snapshot = fs::read_to_string(&cfg.registry.path).unwrap();

    let second = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(second.changed, 0);
    assert_eq!(second.embedded_units, 0);
    assert_eq!(change_count(&cfg).await, logged);
    assert_eq!(fs::read_to_string(&cfg.registry.path).unwrap(), snapshot);

    let warm = pipeline::run(&cfg, RunMode::Warm, &CancelFlag::new()).await.unwrap();
    assert_eq!(warm.changed, 0);
    assert_eq!(change_count(&cfg).await, logged);

    let reg = reload(&cfg);
    assert_eq!(reg.get("gov").unwrap().classification, Classification::Government);
    assert_eq!(reg.get("fp").unwrap().classification, Classification::ForProfit);
}

#[tokio::test]
async fn manual_conflict_is_flagged_once() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &["reu,Reuters,reuters.com,reu.txt,non-profit,1.0,,manual,2024-01-01T00:00:00Z"],
        &[("reu.txt", "Global wire reporting on markets and politics.")],
    );

    let first = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(first.conflicts, 1);
    let reg = reload(&cfg);
    let reu = reg.get("reu").unwrap();
    assert_eq!(reu.classification, Classification::NonProfit);
    assert_eq!(reu.review, Some(Classification::ForProfit));

    let second = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(second.changed, 0);
    assert_eq!(change_count(&cfg).await, 1);
}

#[tokio::test]
async fn malformed_rows_survive_a_run() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &[
            "a,Alpha Review,alpha.example,a.txt,,,,,",
            "bad,Broken Row,bad.example,bad.txt,charity,0.5,,,",
            "a,Duplicate Alpha,alpha2.example,a.txt,,,,,",
        ],
        &[("a.txt", "Essays and reviews.")],
    );

    let report = pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
    assert_eq!(report.rejected_rows, 2);
    let written = fs::read_to_string(&cfg.registry.path).unwrap();
    assert!(written.contains("bad,Broken Row,bad.example,bad.txt,charity,0.5"));
    assert!(written.contains("Duplicate Alpha"));
}

#[tokio::test]
async fn cancelled_run_does_not_rewrite_registry() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &["x,Example Press,example.com,x.txt,,,,,"],
        &[("x.txt", "Daily headlines.")],
    );
    let before = fs::read(&cfg.registry.path).unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let report = pipeline::run(&cfg, RunMode::Cold, &cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(fs::read(&cfg.registry.path).unwrap(), before);

    let pool = storage::connect(&cfg.database.path).await.unwrap();
    let runs = storage::runs::last_runs(&pool, 1).await.unwrap();
    assert!(runs[0].cancelled);
}

#[tokio::test]
async fn warm_run_places_new_sources_and_queries_work() {
    let temp = tempdir().unwrap();
    let cfg = setup(
        temp.path(),
        &[
            "c1,Climate Collective,c1.example,c1.txt,non-profit,1.0,,manual,2024-01-01T00:00:00Z",
            "c2,Carbon Collective,c2.example,c2.txt,,,,,",
            "s1,Match Reports,s1.example,s1.txt,,,,,",
            "s2,League Tables,s2.example,s2.txt,,,,,",
        ],
        &[
            ("c1.txt", "climate change carbon emissions warming climate policy"),
            ("c2.txt", "carbon emissions climate change warming climate science"),
            ("s1.txt", "football league match reports goals football scores"),
            ("s2.txt", "football league tables goals football fixtures"),
        ],
    );
    pipeline::run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();

    let mut csv = fs::read_to_string(&cfg.registry.path).unwrap();
    csv.push_str("c3,Warming Collective,c3.example,c3.txt,,,,,,\n");
    fs::write(&cfg.registry.path, csv).unwrap();
    fs::write(
        temp.path().join("texts").join("c3.txt"),
        "climate change warming carbon emissions climate",
    )
    .unwrap();

    let warm = pipeline::run(&cfg, RunMode::Warm, &CancelFlag::new()).await.unwrap();
    assert_eq!(warm.processed, 5);

    let service = QueryService::open(&cfg).await.unwrap();
    let hits = service.search("carbon emissions", 3, &[]).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].source_id.starts_with('c'));

    let similar = service.similar_to("s1", 1).unwrap();
    assert_eq!(similar[0].source_id, "s2");

    let views: Vec<_> = service
        .cluster_ids()
        .into_iter()
        .map(|id| service.cluster_view(id).unwrap())
        .collect();
    let placed: usize = views.iter().map(|v| v.members.len()).sum();
    assert_eq!(placed, 5);
}
