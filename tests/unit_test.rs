use docvec::indexing::chunker::fragment_id;
use docvec::{split, Document, Fragment, Result, VectorStore};
use tempfile::TempDir;

fn with_vector(mut fragment: Fragment, vector: Vec<f32>) -> Fragment {
    fragment.vector = Some(vector);
    fragment
}

/// Consecutive fragments share exactly `overlap` characters
#[test]
fn test_split_overlap_is_exact() {
    let mut text = String::new();
    for i in 0..30 {
        text.push_str(&format!("## Heading {}\n\nParagraph {} has a few sentences. It goes on a bit! Does it end?\n\n", i, i));
    }
    let doc = Document::new("/docs/long.md", text.clone());
    let chars: Vec<char> = text.chars().collect();

    let fragments = split(&doc, 120, 30);
    assert!(fragments.len() > 1);
    assert_eq!(fragments[0].start_offset, 0);
    assert_eq!(fragments.last().unwrap().range().end, chars.len());

    for fragment in &fragments {
        assert!(fragment.length <= 120);
        let expected: String = chars[fragment.range()].iter().collect();
        assert_eq!(fragment.text, expected);
        assert_eq!(fragment.id, fragment_id("/docs/long.md", fragment.start_offset));
    }
    for pair in fragments.windows(2) {
        assert_eq!(pair[0].range().end - pair[1].start_offset, 30);
    }
}

#[test]
fn test_split_short_and_empty_documents() {
    let short = Document::new("/docs/short.md", "Just one line.");
    let fragments = split(&short, 100, 20);
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].text, "Just one line.");

    let empty = Document::new("/docs/empty.md", "");
    assert!(split(&empty, 100, 20).is_empty());
}

/// Offsets count characters, so multi-byte text never splits inside a character
#[test]
fn test_split_multibyte_text() {
    let text = "Größe über alles. ".repeat(20) + &"日本語の文章です。".repeat(20);
    let doc = Document::new("/docs/utf8.md", text.clone());
    let fragments = split(&doc, 50, 10);
    let chars: Vec<char> = text.chars().collect();
    for fragment in &fragments {
        assert!(fragment.length <= 50);
        let expected: String = chars[fragment.range()].iter().collect();
        assert_eq!(fragment.text, expected);
    }
}

/// Re-chunking the same document yields identical fragments
#[test]
fn test_split_is_deterministic() {
    let doc = Document::new("/docs/a.md", "word ".repeat(200));
    assert_eq!(split(&doc, 64, 16), split(&doc, 64, 16));
}

/// Test VectorStore operations through the public API
#[test]
fn test_vector_store_operations() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let location = temp_dir.path().join("index");

    let mut store = VectorStore::load(&location)?;
    assert!(store.is_empty());
    assert!(store.search(&[1.0, 0.0], 3)?.is_empty());

    let doc = Document::new("/docs/a.md", "alpha");
    let fragments: Vec<Fragment> = split(&doc, 100, 10)
        .into_iter()
        .map(|f| with_vector(f, vec![1.0, 0.0]))
        .collect();
    store.add(fragments.clone())?;
    assert_eq!(store.add(fragments)?, 1, "same id replaces");
    assert_eq!(store.len(), 1);

    store.persist()?;
    let reloaded = VectorStore::load(&location)?;
    let results = reloaded.search(&[1.0, 0.0], 3)?;
    assert_eq!(results.len(), 1);
    assert!((results[0].score - 1.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_vector_store_remove_nonexistent() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let mut store = VectorStore::empty(temp_dir.path());
    assert_eq!(store.remove_source("nonexistent.md"), 0);
    Ok(())
}
