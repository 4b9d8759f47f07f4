use std::collections::BTreeSet;
use std::sync::Arc;

use iris_cluster::{
    AnalyzerKind, CountRequest, DeleteRequest, Document, Facet, FacetType, FieldConfig,
    FieldSort, FileCatalog, GetTermsRequest, IndexConfig, IndexManager, ManagerConfig,
    MemoryShardFactory, QueryRequest, Result, SortType, SortValue, StaticMembership,
    StoreRequest,
};
use tempfile::TempDir;

fn docs_config() -> IndexConfig {
    IndexConfig::builder("docs", 2, "id")
        .default_search_field("title")
        .add_field(
            FieldConfig::builder("title")
                .index_as(AnalyzerKind::Standard)
                .build(),
        )
        .add_field(
            FieldConfig::builder("rating")
                .index_as(AnalyzerKind::NumericLong)
                .sort_as(SortType::NumericLong)
                .build(),
        )
        .add_field(
            FieldConfig::builder("color")
                .index_as(AnalyzerKind::LcKeyword)
                .facet_as(FacetType::Standard)
                .build(),
        )
        .segment_commit_interval(1)
        .segment_flush_interval(1)
        .build()
}

fn single_node() -> Result<Arc<IndexManager>> {
    IndexManager::builder(Arc::new(StaticMembership::new("node-a".into())))
        .config(ManagerConfig {
            worker_threads: 2,
            ..Default::default()
        })
        .build()
}

fn store(manager: &IndexManager, id: &str, title: &str, rating: i64, color: &str) -> Result<()> {
    let document = Document::new()
        .add_field("title", title)
        .add_field("rating", rating)
        .add_field("color", color);
    manager.store(&StoreRequest::new("docs", id, document))
}

#[test]
fn test_sorted_query_and_delete() -> Result<()> {
    // 1. Setup: "a" routes to segment 1, "b" to segment 0
    let manager = single_node()?;
    manager.create_index(docs_config())?;
    store(&manager, "a", "red apple", 1, "red")?;
    store(&manager, "b", "red berry", 2, "blue")?;

    // 2. Sorted by rating, descending
    let top = QueryRequest::builder("*:*")
        .index("docs")
        .sort(FieldSort::desc("rating"))
        .amount(1)
        .build();
    let merged = manager.query(&top)?;
    assert_eq!(merged.total_hits, 2);
    assert_eq!(merged.unique_ids(), vec!["b"]);
    assert_eq!(merged.results[0].sort_values, vec![SortValue::Long(2)]);

    let both = QueryRequest::builder("*:*")
        .index("docs")
        .sort(FieldSort::desc("rating"))
        .amount(2)
        .build();
    assert_eq!(manager.query(&both)?.unique_ids(), vec!["b", "a"]);

    // 3. Delete
    manager.delete(&DeleteRequest::new("docs", "a"))?;
    let apple = QueryRequest::builder("apple").index("docs").build();
    assert_eq!(manager.query(&apple)?.total_hits, 0);
    let red = QueryRequest::builder("red").index("docs").build();
    assert_eq!(manager.query(&red)?.unique_ids(), vec!["b"]);

    let counts = manager.get_number_of_docs("docs", false)?;
    assert_eq!(counts.number_of_docs, 1);
    assert_eq!(counts.segment_counts.len(), 2);

    manager.shutdown();
    Ok(())
}

#[test]
fn test_sorted_pagination_visits_every_document_once() -> Result<()> {
    let manager = single_node()?;
    manager.create_index(docs_config())?;
    for i in 0..20 {
        store(&manager, &format!("doc-{}", i), "page", i, "red")?;
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let mut builder = QueryRequest::builder("page")
            .index("docs")
            .sort(FieldSort::asc("rating"))
            .amount(3);
        if let Some(cursor) = cursor.take() {
            builder = builder.last_result(cursor);
        }
        let merged = manager.query(&builder.build())?;
        assert_eq!(merged.total_hits, 20);
        if merged.results.is_empty() {
            break;
        }
        seen.extend(merged.results.iter().map(|r| r.sort_values[0].clone()));
        cursor = Some(merged.last_result);
        assert!(seen.len() <= 20, "pagination repeated documents");
    }

    let expected: Vec<SortValue> = (0..20).map(SortValue::Long).collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[test]
fn test_facet_counts_across_segments() -> Result<()> {
    let manager = single_node()?;
    manager.create_index(docs_config())?;
    let colors = ["blue", "green", "blue", "green", "blue", "red"];
    for (i, color) in colors.iter().enumerate() {
        store(&manager, &format!("item-{}", i), "shirt", i as i64, color)?;
    }

    let request = QueryRequest::builder("shirt")
        .index("docs")
        .count(CountRequest::new(Facet::new("color")).max_facets(10))
        .build();
    let merged = manager.query(&request)?;
    let group = merged.facet_group("color").expect("color facets");
    assert_eq!(group.count_for("blue"), Some(3));
    assert_eq!(group.count_for("green"), Some(2));
    assert_eq!(group.count_for("red"), Some(1));

    let drilled = QueryRequest::builder("shirt")
        .index("docs")
        .drill_down(Facet::with_path("color", ["green"]))
        .build();
    let merged = manager.query(&drilled)?;
    let ids: BTreeSet<&str> = merged.unique_ids().into_iter().collect();
    assert_eq!(ids, BTreeSet::from(["item-1", "item-3"]));
    Ok(())
}

#[test]
fn test_terms_and_field_names() -> Result<()> {
    let manager = single_node()?;
    manager.create_index(docs_config())?;
    store(&manager, "a", "apple banana", 1, "red")?;
    store(&manager, "b", "banana cherry", 2, "red")?;
    store(&manager, "c", "cherry", 3, "red")?;

    let response = manager.get_terms(&GetTermsRequest::new("docs", "title", 10))?;
    let terms: Vec<(&str, u64)> = response
        .terms
        .iter()
        .map(|t| (t.value.as_str(), t.doc_freq))
        .collect();
    assert_eq!(terms, vec![("apple", 1), ("banana", 2), ("cherry", 2)]);
    assert_eq!(response.last_term.map(|t| t.value), Some("cherry".to_string()));

    let frequent = manager.get_terms(&GetTermsRequest::new("docs", "title", 10).min_doc_freq(2))?;
    assert_eq!(frequent.terms.len(), 2);

    let fields = manager.get_field_names("docs")?;
    assert!(fields.contains("title"));
    assert!(fields.contains("rating"));
    Ok(())
}

#[test]
fn test_file_backed_index_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let open = || -> Result<Arc<IndexManager>> {
        IndexManager::builder(Arc::new(StaticMembership::new("node-a".into())))
            .config(ManagerConfig {
                worker_threads: 2,
                ..Default::default()
            })
            .catalog(Arc::new(FileCatalog::open(dir.path().join("catalog"))?))
            .shard_factory(Arc::new(MemoryShardFactory::with_root(dir.path().join("shards"))))
            .build()
    };

    {
        let manager = open()?;
        manager.create_index(docs_config())?;
        store(&manager, "a", "kept apple", 1, "red")?;
        store(&manager, "b", "kept berry", 2, "blue")?;
        manager.shutdown();
    }

    let manager = open()?;
    assert_eq!(manager.load_indexes()?, vec!["docs"]);
    assert_eq!(manager.get_number_of_docs("docs", false)?.number_of_docs, 2);
    let merged = manager.query(&QueryRequest::builder("kept").index("docs").build())?;
    assert_eq!(merged.total_hits, 2);

    manager.delete_index("docs")?;
    assert!(manager.get_indexes().is_empty());
    assert!(!dir.path().join("shards").join("docs").exists());
    Ok(())
}
