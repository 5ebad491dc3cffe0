//! What the editor ends up showing as files move in and out of projects,
//! get fixed, get closed or break in unexpected ways.

mod common;

use clausewright_core::{RootResolution, Severity, SourceKind};
use common::{LOGIC, harness};

const GRAMMAR: &str = "text/grammar.tem.md";
const MARKER: &str = r#"{ "name": "draft", "accordproject": { "template": "clause" } }"#;

#[tokio::test]
async fn test_file_outside_any_project_gets_one_root_warning() {
    let h = harness();
    let loose = h.dir.path().join("notes/model.cto");
    std::fs::create_dir_all(loose.parent().unwrap()).unwrap();
    std::fs::write(&loose, "namespace loose\n").unwrap();

    for _ in 0..2 {
        let root = h
            .validator
            .open(loose.clone(), "namespace loose\n".to_owned())
            .await;
        assert!(root.is_none());
        h.settle().await;
    }

    let shown = h.sink.current(&loose);
    assert_eq!(shown.len(), 1, "{shown:#?}");
    assert_eq!(shown[0].kind, SourceKind::Root);
    assert_eq!(shown[0].severity, Severity::Warning);
    assert!(shown[0].message.contains("package.json"));
}

#[tokio::test]
async fn test_creating_a_marker_clears_the_root_warning() {
    let h = harness();
    let project = h.dir.path().join("draft");
    let model = project.join("model/model.cto");
    std::fs::create_dir_all(model.parent().unwrap()).unwrap();
    std::fs::write(&model, "namespace org.example.draft\n").unwrap();

    h.validator
        .open(model.clone(), "namespace org.example.draft\n".to_owned())
        .await;
    h.settle().await;
    assert_eq!(h.sink.current(&model).len(), 1);

    let marker = project.join("package.json");
    std::fs::write(&marker, MARKER).unwrap();
    let root = h.validator.disk_changed(&marker).await;
    assert_eq!(root.as_deref(), Some(project.as_path()));
    h.settle().await;

    assert!(h.sink.current(&model).is_empty(), "{:#?}", h.sink.snapshot());
}

#[tokio::test]
async fn test_fixing_an_error_publishes_an_empty_set() {
    let h = harness();
    h.open_and_settle(GRAMMAR).await;

    h.edit(GRAMMAR, "Hello {{nobody}}.\n").await;
    h.settle().await;
    assert_eq!(h.shown(GRAMMAR).len(), 1);

    h.edit(GRAMMAR, "Hello {{name}}.\n").await;
    h.settle().await;

    let publications = h.sink.publications_for(&h.path(GRAMMAR));
    assert!(publications.last().unwrap().is_empty());
    assert!(h.sink.snapshot().is_empty());
}

#[tokio::test]
async fn test_stages_only_clear_their_own_diagnostics() {
    let h = harness();
    h.write("logic/logic.ergo", "namespace x\n\nCOMPILE ERROR\n");
    h.open_and_settle("logic/logic.ergo").await;
    assert_eq!(h.shown("logic/logic.ergo").len(), 1);
    let logic_publications = h.sink.publications_for(&h.path("logic/logic.ergo")).len();

    // A grammar edit does not recompile the logic, so its error stays put.
    h.edit(GRAMMAR, "Hello {{name}}!\n").await;
    h.settle().await;

    let shown = h.shown("logic/logic.ergo");
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].kind, SourceKind::Logic);
    assert_eq!(
        h.sink.publications_for(&h.path("logic/logic.ergo")).len(),
        logic_publications,
        "logic file was not touched by the grammar pass"
    );

    h.edit("logic/logic.ergo", LOGIC).await;
    h.settle().await;
    assert!(h.shown("logic/logic.ergo").is_empty());
}

#[tokio::test]
async fn test_model_error_leaves_an_unrelated_logic_error_alone() {
    let h = harness();
    h.write("logic/logic.ergo", "namespace x\n\nCOMPILE ERROR\n");
    h.open_and_settle("logic/logic.ergo").await;
    assert_eq!(h.shown("logic/logic.ergo").len(), 1);
    let logic_publications = h.sink.publications_for(&h.path("logic/logic.ergo")).len();

    h.edit(
        "model/model.cto",
        "namespace org.example.helloworld\n\nSYNTAX ERROR here\n",
    )
    .await;
    h.settle().await;

    assert_eq!(h.shown("model/model.cto").len(), 1);
    let shown = h.shown("logic/logic.ergo");
    assert_eq!(shown.len(), 1, "{shown:#?}");
    assert_eq!(shown[0].kind, SourceKind::Logic);
    assert_eq!(
        h.sink.publications_for(&h.path("logic/logic.ergo")).len(),
        logic_publications,
        "the failed model pass republished the logic file"
    );
}

#[tokio::test]
async fn test_plain_package_json_is_not_flagged() {
    let h = harness();
    let manifest = h.dir.path().join("tooling/package.json");
    std::fs::create_dir_all(manifest.parent().unwrap()).unwrap();
    let text = r#"{ "name": "npm-thing", "version": "1.0.0" }"#;
    std::fs::write(&manifest, text).unwrap();

    let root = h.validator.open(manifest.clone(), text.to_owned()).await;
    assert!(root.is_none());
    h.settle().await;

    assert!(h.sink.current(&manifest).is_empty(), "{:#?}", h.sink.snapshot());
    assert!(h.validator.published(&manifest).is_empty());
}

#[tokio::test]
async fn test_unsaved_marker_buffer_decides_the_root() {
    let h = harness();
    let project = h.dir.path().join("draft");
    let model = project.join("model/model.cto");
    std::fs::create_dir_all(model.parent().unwrap()).unwrap();
    std::fs::write(&model, "namespace org.example.draft\n").unwrap();
    let marker = project.join("package.json");

    assert!(matches!(
        h.validator.resolve(&model).await,
        RootResolution::NotFound { .. }
    ));

    h.validator.open(marker.clone(), MARKER.to_owned()).await;
    h.settle().await;
    match h.validator.resolve(&model).await {
        RootResolution::Found(root) => {
            assert_eq!(root.path, project);
            assert_eq!(root.name.as_deref(), Some("draft"));
        }
        other => panic!("expected a root, got {other:?}"),
    }

    // The buffer wins over disk in the other direction too.
    std::fs::write(&marker, MARKER).unwrap();
    h.validator
        .change(marker.clone(), r#"{ "name": "draft" }"#.to_owned())
        .await;
    h.settle().await;
    assert!(matches!(
        h.validator.resolve(&model).await,
        RootResolution::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_closing_a_buffer_revalidates_from_disk() {
    let h = harness();
    h.open_and_settle(GRAMMAR).await;
    h.edit(GRAMMAR, "Hello {{nobody}}.\n").await;
    h.settle().await;
    assert_eq!(h.shown(GRAMMAR).len(), 1);

    // Closed without saving: the clean file on disk counts again.
    h.validator.close(&h.path(GRAMMAR)).await;
    h.settle().await;
    assert!(h.shown(GRAMMAR).is_empty());
}

#[tokio::test]
async fn test_invalidate_forgets_the_project() {
    let h = harness();
    h.open_and_settle(GRAMMAR).await;
    h.edit(GRAMMAR, "Hello {{nobody}}.\n").await;
    h.settle().await;
    assert!(!h.sink.snapshot().is_empty());

    h.validator.invalidate(&h.root).await;

    assert!(h.sink.snapshot().is_empty());
    assert!(h.validator.published_all().is_empty());
    assert!(h.validator.cache().get(&h.root).is_none());
    assert!(h.validator.last_report(&h.root).await.is_none());
}

#[tokio::test]
async fn test_unexpected_failure_surfaces_on_the_edited_file() {
    let h = harness();
    h.open_and_settle(GRAMMAR).await;

    // Not UTF-8, so the pass cannot even read it.
    std::fs::write(h.path("model/extra.cto"), b"\xff\xfe\x00").unwrap();
    h.edit(GRAMMAR, "Hello {{name}}.\n").await;
    h.settle().await;

    let shown = h.shown(GRAMMAR);
    assert_eq!(shown.len(), 1, "{shown:#?}");
    assert_eq!(shown[0].kind, SourceKind::Internal);
    assert!(shown[0].message.contains("extra.cto"), "{}", shown[0].message);

    std::fs::remove_file(h.path("model/extra.cto")).unwrap();
    h.edit(GRAMMAR, "Hello {{name}}!\n").await;
    h.settle().await;
    assert!(h.shown(GRAMMAR).is_empty());
}
