//! Skill injection
//!
//! Skills are markdown documents made available to file-access providers.
//! Before execution, selected skills are copied into the working directory
//! as `.claude/skills/<name>/SKILL.md` (clearing whatever was there) and an
//! active-skills list is prepended to the prompt. Prompt-only providers
//! skip all of this.

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

/// A skill document
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub content: String,
}

/// First non-empty, non-heading line serves as the description
fn describe(content: &str) -> String {
    content
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Load skills from a directory. Accepts both `<name>.md` files and
/// `<name>/SKILL.md` layouts.
pub fn load_skills(dir: &Path) -> Vec<Skill> {
    let mut skills = Vec::new();
    if !dir.exists() {
        return skills;
    }

    for entry in WalkDir::new(dir).max_depth(2).into_iter().flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        let name = if path.file_name().and_then(|n| n.to_str()) == Some("SKILL.md") {
            path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str())
        } else {
            path.file_stem().and_then(|n| n.to_str())
        };
        let Some(name) = name else { continue };

        match fs::read_to_string(path) {
            Ok(content) => {
                skills.push(Skill {
                    name: name.to_string(),
                    description: describe(&content),
                    content,
                });
            }
            Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable skill"),
        }
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Pick the skills a task asked for; no hints selects everything
pub fn select<'a>(skills: &'a [Skill], hints: &[String]) -> Vec<&'a Skill> {
    if hints.is_empty() {
        skills.iter().collect()
    } else {
        skills.iter().filter(|s| hints.iter().any(|h| h == &s.name)).collect()
    }
}

/// Copy skills into the working directory, clearing previous contents
pub fn inject(cwd: &Path, skills: &[&Skill]) -> Result<()> {
    let skills_root = cwd.join(".claude").join("skills");

    if skills_root.exists() {
        fs::remove_dir_all(&skills_root).context("Failed to clear existing skills directory")?;
    }
    if skills.is_empty() {
        return Ok(());
    }

    for skill in skills {
        let dir = skills_root.join(&skill.name);
        fs::create_dir_all(&dir).context("Failed to create skill directory")?;
        fs::write(dir.join("SKILL.md"), &skill.content).context("Failed to write skill file")?;
    }

    debug!(count = skills.len(), cwd = %cwd.display(), "Injected skills");
    Ok(())
}

/// The active-skills list prepended to the prompt
pub fn preamble(skills: &[&Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut out = String::from("Active skills (see .claude/skills/<name>/SKILL.md):\n");
    for skill in skills {
        out.push_str(&format!("- {}: {}\n", skill.name, skill.description));
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture_dir() -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("rust-style.md"),
            "# Rust style\nHouse style for Rust code.\nDetails...",
        )
        .unwrap();
        let nested = temp.path().join("db-migrations");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("SKILL.md"), "Running schema migrations safely.").unwrap();
        temp
    }

    #[test]
    fn test_load_both_layouts() {
        let temp = fixture_dir();
        let skills = load_skills(temp.path());

        let names: Vec<&str> = skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db-migrations", "rust-style"]);
        assert_eq!(skills[1].description, "Rust style");
        assert_eq!(skills[0].description, "Running schema migrations safely.");
    }

    #[test]
    fn test_load_missing_dir() {
        assert!(load_skills(Path::new("/no/such/dir")).is_empty());
    }

    #[test]
    fn test_select_by_hint() {
        let temp = fixture_dir();
        let skills = load_skills(temp.path());

        let all = select(&skills, &[]);
        assert_eq!(all.len(), 2);

        let picked = select(&skills, &["rust-style".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "rust-style");

        let none = select(&skills, &["unknown".to_string()]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_inject_clears_and_writes() {
        let source = fixture_dir();
        let skills = load_skills(source.path());
        let picked = select(&skills, &[]);

        let cwd = tempdir().unwrap();
        // Pre-existing stale skill should disappear
        let stale = cwd.path().join(".claude/skills/stale");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("SKILL.md"), "old").unwrap();

        inject(cwd.path(), &picked).unwrap();

        assert!(!stale.exists());
        assert!(cwd.path().join(".claude/skills/rust-style/SKILL.md").exists());
        assert!(cwd.path().join(".claude/skills/db-migrations/SKILL.md").exists());
    }

    #[test]
    fn test_preamble() {
        let temp = fixture_dir();
        let skills = load_skills(temp.path());
        let picked = select(&skills, &[]);

        let text = preamble(&picked);
        assert!(text.starts_with("Active skills"));
        assert!(text.contains("- rust-style: Rust style"));

        assert!(preamble(&[]).is_empty());
    }
}
