//! Sweeps a local fixture corpus, decoding every model and motion file and
//! re-encoding the models to check the round trip against real data.
//!
//! The corpus is not checked in; drop `.pmx`, `.pmd` and `.vmd` files under
//! `tests/fixtures/` to run against them. With no corpus present the tests
//! pass vacuously.

use mmdio::{ModelVersion, TextCodec};
use std::path::Path;
use walkdir::WalkDir;

fn fixtures(extension: &str) -> Vec<std::path::PathBuf> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .map(|e| e.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn corpus_models_roundtrip() {
    for path in fixtures("pmx").into_iter().chain(fixtures("pmd")) {
        let bytes = std::fs::read(&path).unwrap();
        let doc = mmdio::decode_model(&bytes)
            .unwrap_or_else(|e| panic!("decoding {:?} failed: {}", path, e));
        let reencoded = mmdio::encode_model(&doc)
            .unwrap_or_else(|e| panic!("re-encoding {:?} failed: {}", path, e));
        let doc2 = mmdio::decode_model(&reencoded)
            .unwrap_or_else(|e| panic!("decoding re-encoded {:?} failed: {}", path, e));
        // Encoding promotes legacy headers, so compare against the promoted
        // form rather than the original one.
        let mut expected = doc;
        if expected.header.version.is_legacy() {
            expected.header.version = ModelVersion::Pmx20;
        }
        if expected.header.text_codec == TextCodec::ShiftJis {
            expected.header.text_codec = TextCodec::Utf16Le;
        }
        assert_eq!(doc2, expected, "unstable round trip for {:?}", path);
    }
}

#[test]
fn corpus_motions_roundtrip() {
    for path in fixtures("vmd") {
        let bytes = std::fs::read(&path).unwrap();
        let doc = mmdio::decode_motion(&bytes)
            .unwrap_or_else(|e| panic!("decoding {:?} failed: {}", path, e));
        let reencoded = mmdio::encode_motion(&doc);
        let doc2 = mmdio::decode_motion(&reencoded)
            .unwrap_or_else(|e| panic!("decoding re-encoded {:?} failed: {}", path, e));
        assert_eq!(doc2, doc, "unstable round trip for {:?}", path);
    }
}
