//! Project scaffolding for `kiln init`.

use std::path::Path;

use kiln_config::manifest::{
    BuildSettings, CardinalityDecl, CategoryDecl, KindDecl, OutputDecl, SlotDecl, SourceDecl,
    TaskDecl,
};
use kiln_config::Manifest;

use crate::error::EngineError;
use crate::project::MANIFEST_FILE;

/// Scaffold a new Kiln project in `dir`.
///
/// Writes a `kiln.toml` with a small text pipeline, a `src/` directory with
/// one input file, and a `.gitignore` for the state and build directories.
///
/// # Errors
/// Returns an error if a `kiln.toml` already exists in `dir` or the files
/// cannot be written.
pub fn init_project(name: &str, dir: &Path) -> Result<(), EngineError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if manifest_path.exists() {
        return Err(EngineError::ProjectExists {
            path: manifest_path.display().to_string(),
        });
    }

    let src_dir = dir.join("src");
    kiln_util::fs::ensure_dir(&src_dir)?;

    let manifest = starter_manifest();
    write(&manifest_path, &manifest.to_toml()?)?;
    write(&src_dir.join("hello.txt"), &format!("hello from {name}\n"))?;
    write(&dir.join(".gitignore"), ".kiln/\nbuild/\n")?;
    Ok(())
}

fn starter_manifest() -> Manifest {
    let sh = |script: &str| vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()];
    let slot = |id: &str, kind, cardinality, category, appendable| SlotDecl {
        id: id.to_owned(),
        kind,
        cardinality,
        category,
        appendable,
    };
    let task = |id: &str, input: &str, output: &str, path: &str, script: &str| TaskDecl {
        id: id.to_owned(),
        inputs: vec![input.to_owned()],
        outputs: vec![OutputDecl {
            slot: output.to_owned(),
            paths: vec![path.to_owned()],
        }],
        command: sh(script),
        env: Default::default(),
        config: toml::Table::new(),
        fingerprint_inputs: None,
    };

    Manifest {
        build: BuildSettings::default(),
        slots: vec![
            slot(
                "text",
                KindDecl::Directory,
                CardinalityDecl::Single,
                CategoryDecl::Sources,
                false,
            ),
            slot(
                "shout",
                KindDecl::File,
                CardinalityDecl::Single,
                CategoryDecl::Intermediates,
                false,
            ),
            slot(
                "reports",
                KindDecl::Directory,
                CardinalityDecl::Multiple,
                CategoryDecl::Outputs,
                true,
            ),
        ],
        sources: vec![SourceDecl {
            slot: "text".to_owned(),
            paths: vec!["src".to_owned()],
        }],
        tasks: vec![
            task(
                "shout",
                "text",
                "shout",
                "build/shout.txt",
                "cat src/*.txt | tr a-z A-Z > \"$KILN_OUTPUT_SHOUT\"",
            ),
            task(
                "count",
                "shout",
                "reports",
                "build/reports/count",
                "mkdir -p build/reports/count && wc -c < \"$KILN_INPUT_SHOUT\" > build/reports/count/bytes.txt",
            ),
            task(
                "list",
                "text",
                "reports",
                "build/reports/list",
                "mkdir -p build/reports/list && ls src > build/reports/list/files.txt",
            ),
        ],
    }
}

fn write(path: &Path, content: &str) -> Result<(), EngineError> {
    std::fs::write(path, content).map_err(|source| EngineError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::project::{BuildOptions, Project};
    use crate::session::CancellationToken;

    #[test]
    fn creates_project_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let project_dir = tmp.path().join("pipeline");

        init_project("pipeline", &project_dir).unwrap();

        assert!(project_dir.join("kiln.toml").exists());
        assert!(project_dir.join("src").join("hello.txt").exists());
        let gitignore = fs::read_to_string(project_dir.join(".gitignore")).unwrap();
        assert!(gitignore.contains(".kiln/"));
    }

    #[test]
    fn refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        init_project("one", tmp.path()).unwrap();
        let err = init_project("two", tmp.path()).unwrap_err();
        assert!(matches!(err, EngineError::ProjectExists { .. }));
        let hello = fs::read_to_string(tmp.path().join("src/hello.txt")).unwrap();
        assert!(hello.contains("one"));
    }

    #[test]
    fn manifest_parses_back() {
        let tmp = tempfile::tempdir().unwrap();
        init_project("demo", tmp.path()).unwrap();
        let manifest = Manifest::from_path(&tmp.path().join("kiln.toml")).unwrap();
        assert_eq!(manifest, starter_manifest());
    }

    #[test]
    fn starter_project_builds() {
        let tmp = tempfile::tempdir().unwrap();
        init_project("demo", tmp.path()).unwrap();
        let project = Project::load(tmp.path()).unwrap();
        let result = project
            .build(&BuildOptions::default(), &CancellationToken::new())
            .unwrap();
        assert!(result.is_success(), "reports: {:?}", result.reports);
        let shout = fs::read_to_string(tmp.path().join("build/shout.txt")).unwrap();
        assert_eq!(shout, "HELLO FROM DEMO\n");
        assert!(tmp.path().join("build/reports/list/files.txt").exists());
    }
}
