//! Text/binary classification and the extractor façade for structured
//! document formats.
//!
//! Document-format extraction itself (word processor, spreadsheet,
//! slide-deck, PDF parsing) is an injected capability: this crate ships the
//! classification decision tree and the dispatch façade only, per the
//! `TextExtractor` boundary.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileClass {
    Text,
    Word,
    Pdf,
    Excel,
    PowerPoint,
    WordLegacy,
    ExcelLegacy,
    PowerPointLegacy,
    Binary,
}

impl FileClass {
    pub fn is_textual(&self) -> bool {
        !matches!(self, FileClass::Binary)
    }
}

const DOCUMENT_EXTENSIONS: &[(&str, FileClass)] = &[
    ("docx", FileClass::Word),
    ("doc", FileClass::WordLegacy),
    ("pdf", FileClass::Pdf),
    ("xlsx", FileClass::Excel),
    ("xls", FileClass::ExcelLegacy),
    ("pptx", FileClass::PowerPoint),
    ("ppt", FileClass::PowerPointLegacy),
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "hpp", "rb", "php", "cs",
    "json", "yaml", "yml", "toml", "xml", "html", "css", "sh", "bash", "csv", "ini", "cfg", "conf",
    "log",
];

const TEXT_FILENAMES: &[&str] = &["Dockerfile", "Makefile", "README", "LICENSE", "CHANGELOG"];

/// Classifies `path` following the decision order: document-extension
/// table, text-extension table, well-known extensionless names, MIME
/// sniff, then a UTF-8 probe of the first 1 KiB.
pub fn classify(path: impl AsRef<Path>) -> FileClass {
    let path = path.as_ref();

    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let ext_lower = ext.to_lowercase();
        for (known_ext, class) in DOCUMENT_EXTENSIONS {
            if *known_ext == ext_lower {
                return *class;
            }
        }
        if TEXT_EXTENSIONS.contains(&ext_lower.as_str()) {
            return FileClass::Text;
        }
    }

    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if TEXT_FILENAMES.iter().any(|known| known.eq_ignore_ascii_case(name)) {
            return FileClass::Text;
        }
    }

    if let Some(mime) = mime_guess::from_path(path).first() {
        if mime.type_() == mime_guess::mime::TEXT {
            return FileClass::Text;
        }
    }

    if probe_utf8(path) {
        FileClass::Text
    } else {
        FileClass::Binary
    }
}

fn probe_utf8(path: &Path) -> bool {
    let mut buf = [0u8; 1024];
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    std::str::from_utf8(&buf[..n]).is_ok()
}

/// Capability injected by the embedder: converts a structured document at
/// `path` into plain text. Implementations for word/pdf/excel/powerpoint
/// formats live outside this crate.
pub trait TextExtractor: Send + Sync {
    /// Returns the classes this extractor can handle.
    fn handles(&self) -> &[FileClass];
    /// Extracts text content. Returns an empty string on failure, matching
    /// the façade's "unsupported legacy type returns empty string" rule.
    fn extract(&self, path: &Path) -> String;
}

/// Dispatches to whichever `TextExtractor` is registered for a file's
/// class; legacy formats and files with no registered extractor yield an
/// empty string rather than an error, matching the façade contract.
#[derive(Default)]
pub struct ExtractorFacade {
    extractors: HashMap<&'static str, Arc<dyn TextExtractor>>,
}

fn class_key(class: FileClass) -> &'static str {
    match class {
        FileClass::Word => "word",
        FileClass::Pdf => "pdf",
        FileClass::Excel => "excel",
        FileClass::PowerPoint => "powerpoint",
        FileClass::WordLegacy => "word_legacy",
        FileClass::ExcelLegacy => "excel_legacy",
        FileClass::PowerPointLegacy => "powerpoint_legacy",
        FileClass::Text => "text",
        FileClass::Binary => "binary",
    }
}

impl ExtractorFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extractor: Arc<dyn TextExtractor>) {
        for class in extractor.handles() {
            self.extractors.insert(class_key(*class), extractor.clone());
        }
    }

    /// Extracts text for `path` given its already-computed classification.
    /// Plain `text` files are read directly; everything else is routed
    /// through a registered extractor, or yields `""` if none is
    /// registered for that class.
    pub fn extract_text(&self, path: &Path, class: FileClass) -> String {
        match class {
            FileClass::Text => std::fs::read_to_string(path).unwrap_or_default(),
            FileClass::Binary => String::new(),
            other => match self.extractors.get(class_key(other)) {
                Some(extractor) => extractor.extract(path),
                None => String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn known_text_extension_classifies_as_text() {
        let path = Path::new("notes.md");
        assert_eq!(classify(path), FileClass::Text);
    }

    #[test]
    fn known_document_extension_classifies_specifically() {
        assert_eq!(classify(Path::new("report.docx")), FileClass::Word);
        assert_eq!(classify(Path::new("report.pdf")), FileClass::Pdf);
        assert_eq!(classify(Path::new("sheet.xlsx")), FileClass::Excel);
    }

    #[test]
    fn well_known_extensionless_name_is_text() {
        assert_eq!(classify(Path::new("Dockerfile")), FileClass::Text);
        assert_eq!(classify(Path::new("Makefile")), FileClass::Text);
    }

    #[test]
    fn utf8_content_without_known_extension_probes_as_text() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"just some plain words here").unwrap();
        let renamed = f.path().with_extension("unknownext");
        std::fs::copy(f.path(), &renamed).unwrap();
        assert_eq!(classify(&renamed), FileClass::Text);
        let _ = std::fs::remove_file(&renamed);
    }

    #[test]
    fn binary_content_without_known_extension_is_binary() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&[0xff, 0xfe, 0x00, 0x01, 0x02, 0x80, 0x81]).unwrap();
        let renamed = f.path().with_extension("unknownext2");
        std::fs::copy(f.path(), &renamed).unwrap();
        assert_eq!(classify(&renamed), FileClass::Binary);
        let _ = std::fs::remove_file(&renamed);
    }

    #[test]
    fn is_textual_excludes_only_binary() {
        assert!(FileClass::Text.is_textual());
        assert!(FileClass::Word.is_textual());
        assert!(!FileClass::Binary.is_textual());
    }

    struct StubExtractor;
    impl TextExtractor for StubExtractor {
        fn handles(&self) -> &[FileClass] {
            &[FileClass::Word, FileClass::Pdf]
        }
        fn extract(&self, _path: &Path) -> String {
            "stub text".to_string()
        }
    }

    #[test]
    fn facade_dispatches_one_extractor_across_multiple_classes() {
        let mut facade = ExtractorFacade::new();
        facade.register(Arc::new(StubExtractor));
        assert_eq!(
            facade.extract_text(Path::new("report.docx"), FileClass::Word),
            "stub text"
        );
        assert_eq!(
            facade.extract_text(Path::new("report.pdf"), FileClass::Pdf),
            "stub text"
        );
    }

    #[test]
    fn facade_returns_empty_for_unregistered_legacy_class() {
        let facade = ExtractorFacade::new();
        assert_eq!(
            facade.extract_text(Path::new("report.ppt"), FileClass::PowerPointLegacy),
            ""
        );
    }
}
