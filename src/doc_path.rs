use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DOCUMENT_EXTENSION: &str = "yianazip";
pub const TRASH_DIR: &str = ".Trash";

pub fn has_document_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(DOCUMENT_EXTENSION))
}

/// Components of `path` below `root`, or `None` when `path` is outside it.
fn relative_components<'a>(root: &Path, path: &'a Path) -> Option<Vec<Component<'a>>> {
    let relative = path.strip_prefix(root).ok()?;
    Some(relative.components().collect())
}

/// Whether `path` is a document the pipeline should process: the right
/// extension, inside `root`, and not hidden, trashed, a results artifact or a
/// cloud placeholder.
pub fn is_document_path(root: &Path, results_dir_name: &str, path: &Path) -> bool {
    if !has_document_extension(path) {
        return false;
    }
    let Some(components) = relative_components(root, path) else {
        return false;
    };
    if components.is_empty() {
        return false;
    }

    components.iter().all(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            !name.starts_with('.') && name != TRASH_DIR && name != results_dir_name
        }
        _ => false,
    })
}

/// Directory names a recursive scan never descends into.
pub fn is_ignored_dir_name(name: &str, results_dir_name: &str) -> bool {
    name.starts_with('.') || name == TRASH_DIR || name == results_dir_name
}

/// How side artifacts are arranged under the results directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultsLayout {
    /// `<results_dir>/<relative dir>/<stem>.<ext>`
    #[default]
    Mirrored,
    /// `<results_dir>/<stem>.<ext>`, for consumers that list one directory.
    /// Documents sharing a stem in different folders overwrite each other.
    Flat,
}

pub fn results_path_for(
    root: &Path,
    results_dir_name: &str,
    layout: ResultsLayout,
    document: &Path,
    extension: &str,
) -> PathBuf {
    let file_name = || document.file_name().map(PathBuf::from).unwrap_or_default();
    let relative = match layout {
        ResultsLayout::Mirrored => document
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| file_name()),
        ResultsLayout::Flat => file_name(),
    };
    root.join(results_dir_name)
        .join(relative)
        .with_extension(extension)
}
