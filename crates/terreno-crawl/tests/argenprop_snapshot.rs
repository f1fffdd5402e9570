//! Golden snapshot test for the Argenprop listing-page parser, driven by the
//! checked-in fixture page under `fixtures/argenprop/sample/`.

use std::path::{Path, PathBuf};

use terreno_core::RawListing;
use terreno_crawl::{parse_listing_page, ARGENPROP_BASE_URL};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn read_to_string(path: PathBuf) -> String {
    std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn golden_snapshot_argenprop_listing_page() {
    let root = workspace_root();
    let html = read_to_string(root.join("fixtures/argenprop/sample/listing.html"));
    let page = parse_listing_page(&html, ARGENPROP_BASE_URL).expect("parse listing page");

    let expected: Vec<RawListing> =
        serde_json::from_str(&read_to_string(root.join("fixtures/argenprop/sample/snapshot.json")))
            .expect("parse snapshot");
    assert_eq!(page.listings, expected);
    assert_eq!(
        page.next_page.as_deref(),
        Some("https://www.argenprop.com/terrenos/venta/posadas-pagina-2")
    );
}

#[test]
fn last_page_has_no_next_link() {
    let html = r#"<div class="listing__item">
        <a href="/terrenos/venta/x--1">
          <p class="card__price"><span class="card__currency">USD</span> 10.000</p>
          <p class="card__title--primary">Lote</p>
        </a>
      </div>
      <ul class="pagination"><li class="pagination__page"><a href="/terrenos/venta/posadas">1</a></li></ul>"#;
    let page = parse_listing_page(html, ARGENPROP_BASE_URL).expect("parse listing page");
    assert_eq!(page.listings.len(), 1);
    assert_eq!(page.next_page, None);
}
