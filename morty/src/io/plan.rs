//! Minimal reader for the markdown plan directory.
//!
//! Only what the engine needs to build state is extracted: module display
//! name, module dependencies, and per job its index, title, prerequisites,
//! task checkboxes and raw body. Plan grammar validation lives elsewhere.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::graph::DependencySpec;

static JOB_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#{2,3}\s*job\s*(\d+)\s*[:：]\s*(.*)$").unwrap());
static DEPENDENCIES_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-*]?\s*\*\*(?:dependencies|依赖模块)\*\*\s*[:：]?\s*(.*)$").unwrap()
});
static PREREQ_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-*]?\s*\*\*(?:prerequisites|前置条件)\*\*\s*[:：]?\s*(.*)$").unwrap()
});
static PREREQ_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#{4,}\s*(?:prerequisites|前置条件)\s*$").unwrap());
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+(?:\[[ xX]\]\s*)?(.+?)\s*$").unwrap());
static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s*\[([ xX])\]").unwrap());

/// One job as declared in a plan file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanJob {
    /// `job_N`.
    pub name: String,
    pub index: u32,
    pub title: String,
    pub prerequisites: Vec<String>,
    pub tasks_total: u32,
    pub tasks_completed: u32,
    /// Section text below the heading, used to build prompts.
    pub body: String,
}

/// One plan file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanModule {
    pub name: String,
    pub display_name: String,
    pub plan_file: String,
    pub dependencies: Vec<DependencySpec>,
    pub jobs: Vec<PlanJob>,
}

/// Load every `*.md` plan in `dir` (README excluded), sorted by file name.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn load_plan_dir(dir: &Path) -> Result<Vec<PlanModule>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read plan dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "md") {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.to_ascii_lowercase().starts_with("readme") {
            continue;
        }
        files.push((file_name, path));
    }
    files.sort();

    let readme = dir.join("README.md");
    let index_deps = if readme.is_file() {
        let content = fs::read_to_string(&readme)
            .with_context(|| format!("read {}", readme.display()))?;
        parse_readme_dependencies(&content)
    } else {
        BTreeMap::new()
    };

    let mut modules = Vec::with_capacity(files.len());
    for (file_name, path) in files {
        let content =
            fs::read_to_string(&path).with_context(|| format!("read plan {}", path.display()))?;
        let stem = file_name.trim_end_matches(".md");
        let (mut module, declared) = parse_plan(stem, &file_name, &content);
        if !declared && let Some(deps) = index_deps.get(stem) {
            debug!(module = stem, "dependencies taken from README index");
            module.dependencies = deps.clone();
        }
        if module.jobs.is_empty() {
            warn!(module = stem, "plan declares no jobs");
        }
        modules.push(module);
    }
    Ok(modules)
}

/// Parse one plan file. The flag is true when the file declared dependencies itself.
pub fn parse_plan(name: &str, plan_file: &str, content: &str) -> (PlanModule, bool) {
    let lines: Vec<&str> = content.lines().collect();
    let display_name = lines
        .iter()
        .find_map(|line| line.strip_prefix("# "))
        .map(display_name_from_title)
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| name.to_string());

    let first_job = lines
        .iter()
        .position(|line| JOB_HEADING_RE.is_match(line))
        .unwrap_or(lines.len());
    let declared = find_field(&lines[..first_job], &DEPENDENCIES_FIELD_RE);
    let dependencies = declared
        .as_ref()
        .map(|entries| entries.iter().map(|raw| DependencySpec::parse(raw)).collect())
        .unwrap_or_default();

    let mut jobs = Vec::new();
    let mut idx = first_job;
    while idx < lines.len() {
        let Some(caps) = JOB_HEADING_RE.captures(lines[idx]) else {
            idx += 1;
            continue;
        };
        let end = lines[idx + 1..]
            .iter()
            .position(|line| is_section_break(line))
            .map_or(lines.len(), |offset| idx + 1 + offset);
        let Ok(index) = caps[1].parse::<u32>() else {
            idx = end;
            continue;
        };
        jobs.push(parse_job(index, caps[2].trim(), &lines[idx + 1..end]));
        idx = end;
    }

    let module = PlanModule {
        name: name.to_string(),
        display_name,
        plan_file: plan_file.to_string(),
        dependencies,
        jobs,
    };
    (module, declared.is_some())
}

fn parse_job(index: u32, title: &str, section: &[&str]) -> PlanJob {
    let mut prerequisites = find_field(section, &PREREQ_FIELD_RE).unwrap_or_default();
    if prerequisites.is_empty()
        && let Some(start) = section.iter().position(|line| PREREQ_HEADING_RE.is_match(line))
    {
        prerequisites = section[start + 1..]
            .iter()
            .skip_while(|line| line.trim().is_empty())
            .map_while(|line| list_item(line))
            .collect();
    }

    let mut tasks_total = 0;
    let mut tasks_completed = 0;
    for line in section {
        if let Some(caps) = CHECKBOX_RE.captures(line) {
            tasks_total += 1;
            if !caps[1].trim().is_empty() {
                tasks_completed += 1;
            }
        }
    }

    PlanJob {
        name: format!("job_{index}"),
        index,
        title: title.to_string(),
        prerequisites,
        tasks_total,
        tasks_completed,
        body: section.join("\n").trim().to_string(),
    }
}

/// Map of module (file stem) to dependencies from the README index table.
pub fn parse_readme_dependencies(content: &str) -> BTreeMap<String, Vec<DependencySpec>> {
    let mut out = BTreeMap::new();
    let mut columns: Option<(Option<usize>, Option<usize>, usize)> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('|') {
            columns = None;
            continue;
        }
        let cells = table_cells(trimmed);
        if cells.iter().all(|cell| cell.chars().all(|c| matches!(c, '-' | ':' | ' '))) {
            continue;
        }
        let Some((module_col, file_col, deps_col)) = columns else {
            columns = header_columns(&cells);
            continue;
        };
        let key = file_col
            .and_then(|col| cells.get(col))
            .map(|file| file.trim_matches('`').trim_end_matches(".md").to_string())
            .filter(|file| !file.is_empty())
            .or_else(|| module_col.and_then(|col| cells.get(col)).map(|m| m.to_string()));
        let (Some(key), Some(deps)) = (key, cells.get(deps_col)) else {
            continue;
        };
        out.insert(key, split_inline(deps).iter().map(|raw| DependencySpec::parse(raw)).collect());
    }
    out
}

fn header_columns(cells: &[String]) -> Option<(Option<usize>, Option<usize>, usize)> {
    let find = |keys: &[&str]| {
        cells.iter().position(|cell| {
            let lower = cell.to_lowercase();
            keys.iter().any(|key| lower.contains(key))
        })
    };
    let deps = find(&["dependencies", "依赖"])?;
    Some((find(&["module", "模块"]), find(&["file", "文件"]), deps))
}

fn table_cells(line: &str) -> Vec<String> {
    line.trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Value of a bold field: inline after the colon, or the list that follows it.
fn find_field(lines: &[&str], field: &Regex) -> Option<Vec<String>> {
    let start = lines.iter().position(|line| field.is_match(line))?;
    let inline = field
        .captures(lines[start])
        .and_then(|caps| caps.get(1))
        .map_or("", |m| m.as_str().trim());
    if !inline.is_empty() {
        return Some(split_inline(inline));
    }
    Some(
        lines[start + 1..]
            .iter()
            .skip_while(|line| line.trim().is_empty())
            .map_while(|line| list_item(line))
            .collect(),
    )
}

fn list_item(line: &str) -> Option<String> {
    LIST_ITEM_RE
        .captures(line)
        .map(|caps| caps[1].trim_matches('`').trim().to_string())
        .filter(|item| !item.is_empty())
}

fn split_inline(value: &str) -> Vec<String> {
    value
        .split([',', '，', '、'])
        .map(|part| part.trim().trim_matches('`').trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn display_name_from_title(title: &str) -> String {
    let title = title.trim();
    let lower = title.to_lowercase();
    let rest = if lower.starts_with("plan:") || lower.starts_with("plan：") {
        title
            .split_once([':', '：'])
            .map_or(title, |(_, rest)| rest)
    } else {
        title
    };
    rest.trim().to_string()
}

fn is_section_break(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=3).contains(&hashes) && line[hashes..].starts_with(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_PLAN: &str = "\
# Plan: Configuration

**Dependencies**: logging, `storage`

## Overview

Load settings.

### Job 1: Parse file

**Prerequisites**: none yet

- [x] Task 1: read toml
- [ ] Task 2: merge env

### Job 2：Validate

#### Prerequisites
- job_1 - parsed config
- storage:job_3

- [ ] Task 1: reject zero timeout
";

    #[test]
    fn parses_module_header_and_jobs() {
        let (module, declared) = parse_plan("config", "config.md", CONFIG_PLAN);
        assert!(declared);
        assert_eq!(module.display_name, "Configuration");
        assert_eq!(
            module.dependencies,
            vec![
                DependencySpec::Module("logging".to_string()),
                DependencySpec::Module("storage".to_string()),
            ]
        );
        assert_eq!(module.jobs.len(), 2);

        let first = &module.jobs[0];
        assert_eq!(first.name, "job_1");
        assert_eq!(first.title, "Parse file");
        assert_eq!(first.prerequisites, vec!["none yet".to_string()]);
        assert_eq!((first.tasks_total, first.tasks_completed), (2, 1));
        assert!(first.body.contains("merge env"));

        let second = &module.jobs[1];
        assert_eq!(second.index, 2);
        assert_eq!(
            second.prerequisites,
            vec!["job_1 - parsed config".to_string(), "storage:job_3".to_string()]
        );
        assert_eq!((second.tasks_total, second.tasks_completed), (1, 0));
    }

    #[test]
    fn dependency_list_and_markers() {
        let content = "# Plan: Report\n\n**依赖模块**:\n- 所有模块\n\n### Job 1: Render\n";
        let (module, declared) = parse_plan("report", "report.md", content);
        assert!(declared);
        assert_eq!(module.dependencies, vec![DependencySpec::All]);

        let content = "# Core\n\n**Dependencies**: 无\n\n### Job 1: Boot\n";
        let (module, _) = parse_plan("core", "core.md", content);
        assert_eq!(module.display_name, "Core");
        assert_eq!(module.dependencies, vec![DependencySpec::None]);
    }

    #[test]
    fn missing_title_falls_back_to_stem() {
        let (module, declared) = parse_plan("bare", "bare.md", "### job 3: only\n- [X] done\n");
        assert!(!declared);
        assert_eq!(module.display_name, "bare");
        assert_eq!(module.jobs[0].index, 3);
        assert_eq!(module.jobs[0].tasks_completed, 1);
    }

    #[test]
    fn readme_table_supplies_dependencies() {
        let readme = "\
# Index

| Module | File | Jobs | Dependencies |
|--------|------|------|--------------|
| Config | config.md | 2 | logging, storage |
| Logging | `logging.md` | 1 | 无 |
";
        let deps = parse_readme_dependencies(readme);
        assert_eq!(
            deps.get("config"),
            Some(&vec![
                DependencySpec::Module("logging".to_string()),
                DependencySpec::Module("storage".to_string()),
            ])
        );
        assert_eq!(deps.get("logging"), Some(&vec![DependencySpec::None]));
    }

    #[test]
    fn load_plan_dir_sorts_and_applies_readme() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("b.md"), "# Plan: B\n\n### Job 1: one\n").expect("write b");
        fs::write(
            dir.join("a.md"),
            "# Plan: A\n\n**Dependencies**: none\n\n### Job 1: one\n",
        )
        .expect("write a");
        fs::write(
            dir.join("README.md"),
            "| Module | File | Dependencies |\n|---|---|---|\n| B | b.md | a |\n",
        )
        .expect("write readme");
        fs::write(dir.join("notes.txt"), "ignored").expect("write notes");

        let modules = load_plan_dir(dir).expect("load");
        let names: Vec<&str> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(modules[0].dependencies, vec![DependencySpec::None]);
        assert_eq!(
            modules[1].dependencies,
            vec![DependencySpec::Module("a".to_string())]
        );
    }

    #[test]
    fn missing_plan_dir_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_plan_dir(&temp.path().join("absent")).expect_err("missing");
        assert!(format!("{err:#}").contains("read plan dir"));
    }
}
