//! CVE repository access and tree walking.
//!
//! The CVE list lives in a git repository laid out as
//! `YYYY/NNNxxx/CVE-YYYY-NNNN.json`. Reading the repository itself is an
//! external concern, abstracted behind [`CveRepo`]; the walker enumerates the
//! CVE blobs of a commit, sorts them by `(year, number)` as integers, and
//! groups them into per-directory runs for the incremental-skip optimization.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// A commit: its hash, root tree, and commit time.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub hash: String,
    pub tree: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    Dir,
    File,
}

/// One entry of a tree object.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub hash: String,
    pub kind: TreeEntryKind,
}

/// Read access to a CVE repository at a commit.
pub trait CveRepo: Send + Sync {
    /// The hash of the repository head commit.
    fn head(&self) -> Result<String>;
    /// Resolve a commit by hash ("HEAD" is accepted as an alias).
    fn commit(&self, hash: &str) -> Result<CommitInfo>;
    /// The entries of a tree object.
    fn tree_entries(&self, tree_hash: &str) -> Result<Vec<TreeEntry>>;
    /// The content of a blob object.
    fn blob(&self, blob_hash: &str) -> Result<Vec<u8>>;
}

/// A CVE file found in a commit tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub dir_path: String,
    pub filename: String,
    pub tree_hash: String,
    pub blob_hash: String,
    pub year: i32,
    pub number: i64,
}

impl RepoFile {
    /// The repo-relative path of the file.
    pub fn path(&self) -> String {
        if self.dir_path.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.dir_path, self.filename)
        }
    }

    /// The CVE ID of the file.
    pub fn id(&self) -> &str {
        id_from_filename(&self.filename)
    }
}

/// Extract the CVE ID from a filename, e.g. `CVE-2021-0001.json`.
pub fn id_from_filename(name: &str) -> &str {
    name.strip_suffix(".json").unwrap_or(name)
}

fn is_cve_filename(name: &str) -> bool {
    name.starts_with("CVE-") && name.ends_with(".json")
}

fn parse_cve_filename(name: &str) -> Option<(i32, i64)> {
    let stem = name.strip_suffix(".json")?.strip_prefix("CVE-")?;
    let (year, number) = stem.split_once('-')?;
    Some((year.parse().ok()?, number.parse().ok()?))
}

/// Enumerate every CVE file in the commit tree, sorted by year and number as
/// integers (so CVE-2014-10001 precedes CVE-2014-100009). Uses an explicit
/// worklist; the tree depth is not bounded.
pub fn repo_cve_files(repo: &dyn CveRepo, commit: &CommitInfo) -> Result<Vec<RepoFile>> {
    let mut files = Vec::new();
    let mut worklist = vec![(commit.tree.clone(), String::new())];
    while let Some((tree_hash, dir_path)) = worklist.pop() {
        for entry in repo.tree_entries(&tree_hash)? {
            let path = if dir_path.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir_path, entry.name)
            };
            match entry.kind {
                TreeEntryKind::Dir => worklist.push((entry.hash, path)),
                TreeEntryKind::File => {
                    if !is_cve_filename(&entry.name) {
                        continue;
                    }
                    let (year, number) = parse_cve_filename(&entry.name).ok_or_else(|| {
                        Error::repo(format!("malformed CVE filename: {}", entry.name))
                    })?;
                    files.push(RepoFile {
                        dir_path: dir_path.clone(),
                        filename: entry.name,
                        tree_hash: tree_hash.clone(),
                        blob_hash: entry.hash,
                        year,
                        number,
                    });
                }
            }
        }
    }
    files.sort_by(|a, b| (a.year, a.number).cmp(&(b.year, b.number)));
    Ok(files)
}

/// Collect files by directory, verifying that directories are contiguous in
/// the sorted list. The directory hash optimization depends on that.
pub fn group_files_by_directory(files: Vec<RepoFile>) -> Result<Vec<Vec<RepoFile>>> {
    let mut result: Vec<Vec<RepoFile>> = Vec::new();
    for file in files {
        match result.last_mut() {
            Some(run) if run[0].dir_path == file.dir_path => run.push(file),
            _ => result.push(vec![file]),
        }
    }
    let mut seen = HashSet::new();
    for run in &result {
        if !seen.insert(run[0].dir_path.clone()) {
            return Err(Error::invariant(format!(
                "directory {} is not contiguous in the sorted list of files",
                run[0].dir_path
            )));
        }
    }
    Ok(result)
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// An in-memory repository mirror, also the test double.
///
/// Trees and blobs are content-addressed with a deterministic hash so that
/// unchanged directories keep their tree hash across rebuilds.
pub struct MemRepo {
    head: CommitInfo,
    trees: HashMap<String, Vec<TreeEntry>>,
    blobs: HashMap<String, Vec<u8>>,
}

impl MemRepo {
    /// Build a repository from `path -> content` pairs.
    pub fn new(files: BTreeMap<String, Vec<u8>>, commit_time: DateTime<Utc>) -> Self {
        let mut trees = HashMap::new();
        let mut blobs = HashMap::new();
        let root = Self::build_tree(&files, "", &mut trees, &mut blobs);
        let mut hasher = DefaultHasher::new();
        root.hash(&mut hasher);
        commit_time.timestamp().hash(&mut hasher);
        let head = CommitInfo {
            hash: format!("{:016x}", hasher.finish()),
            tree: root,
            time: commit_time,
        };
        Self { head, trees, blobs }
    }

    /// Load a checkout directory from disk (`-local-cve-repo`). The commit
    /// time is the most recent file modification time.
    pub fn from_dir(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut latest: Option<DateTime<Utc>> = None;
        let mut worklist = vec![root.to_path_buf()];
        while let Some(dir) = worklist.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    worklist.push(path);
                    continue;
                }
                let meta = entry.metadata()?;
                let mtime: DateTime<Utc> = meta.modified()?.into();
                if latest.map_or(true, |l| mtime > l) {
                    latest = Some(mtime);
                }
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| Error::repo(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                files.insert(rel, std::fs::read(&path)?);
            }
        }
        Ok(Self::new(files, latest.unwrap_or_else(Utc::now)))
    }

    fn build_tree(
        files: &BTreeMap<String, Vec<u8>>,
        prefix: &str,
        trees: &mut HashMap<String, Vec<TreeEntry>>,
        blobs: &mut HashMap<String, Vec<u8>>,
    ) -> String {
        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for path in files.keys() {
            let rest = match prefix {
                "" => path.as_str(),
                _ => match path.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
                    Some(r) => r,
                    None => continue,
                },
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_string(), true);
                }
                None => {
                    children.insert(rest.to_string(), false);
                }
            }
        }

        let mut entries = Vec::new();
        for (name, is_dir) in children {
            let child_prefix = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if is_dir {
                let hash = Self::build_tree(files, &child_prefix, trees, blobs);
                entries.push(TreeEntry {
                    name,
                    hash,
                    kind: TreeEntryKind::Dir,
                });
            } else {
                let content = &files[&child_prefix];
                let hash = content_hash(content);
                blobs.insert(hash.clone(), content.clone());
                entries.push(TreeEntry {
                    name,
                    hash,
                    kind: TreeEntryKind::File,
                });
            }
        }

        let mut hasher = DefaultHasher::new();
        for e in &entries {
            e.name.hash(&mut hasher);
            e.hash.hash(&mut hasher);
            matches!(e.kind, TreeEntryKind::Dir).hash(&mut hasher);
        }
        let tree_hash = format!("{:016x}", hasher.finish());
        trees.insert(tree_hash.clone(), entries);
        tree_hash
    }

    /// The head commit.
    pub fn head_commit(&self) -> &CommitInfo {
        &self.head
    }
}

impl CveRepo for MemRepo {
    fn head(&self) -> Result<String> {
        Ok(self.head.hash.clone())
    }

    fn commit(&self, hash: &str) -> Result<CommitInfo> {
        if hash == self.head.hash || hash == "HEAD" {
            Ok(self.head.clone())
        } else {
            Err(Error::repo(format!("unknown commit: {hash}")))
        }
    }

    fn tree_entries(&self, tree_hash: &str) -> Result<Vec<TreeEntry>> {
        self.trees
            .get(tree_hash)
            .cloned()
            .ok_or_else(|| Error::repo(format!("unknown tree: {tree_hash}")))
    }

    fn blob(&self, blob_hash: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(blob_hash)
            .cloned()
            .ok_or_else(|| Error::repo(format!("unknown blob: {blob_hash}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(dir: &str, name: &str) -> RepoFile {
        RepoFile {
            dir_path: dir.to_string(),
            filename: name.to_string(),
            tree_hash: String::new(),
            blob_hash: String::new(),
            year: 2021,
            number: 1,
        }
    }

    fn basic_repo() -> MemRepo {
        let files: BTreeMap<String, Vec<u8>> = [
            ("2021/0xxx/CVE-2021-0001.json", "{}"),
            ("2021/0xxx/CVE-2021-0010.json", "{}"),
            ("2021/1xxx/CVE-2021-1384.json", "{}"),
            ("2020/9xxx/CVE-2020-9283.json", "{}"),
            ("2021/0xxx/README.md", "not a cve"),
        ]
        .into_iter()
        .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
        .collect();
        MemRepo::new(files, Utc::now())
    }

    #[test]
    fn walker_sorts_by_year_and_number() {
        let repo = basic_repo();
        let files = repo_cve_files(&repo, repo.head_commit()).unwrap();
        let got: Vec<(String, String)> = files
            .iter()
            .map(|f| (f.dir_path.clone(), f.filename.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("2020/9xxx".to_string(), "CVE-2020-9283.json".to_string()),
                ("2021/0xxx".to_string(), "CVE-2021-0001.json".to_string()),
                ("2021/0xxx".to_string(), "CVE-2021-0010.json".to_string()),
                ("2021/1xxx".to_string(), "CVE-2021-1384.json".to_string()),
            ]
        );
        assert_eq!(files[1].year, 2021);
        assert_eq!(files[1].number, 1);
        assert_eq!(files[1].id(), "CVE-2021-0001");
    }

    #[test]
    fn numeric_sort_beats_lexical() {
        let files: BTreeMap<String, Vec<u8>> = [
            "2014/100xxx/CVE-2014-100009.json",
            "2014/10xxx/CVE-2014-10001.json",
        ]
        .into_iter()
        .map(|p| (p.to_string(), b"{}".to_vec()))
        .collect();
        let repo = MemRepo::new(files, Utc::now());
        let files = repo_cve_files(&repo, repo.head_commit()).unwrap();
        assert_eq!(files[0].filename, "CVE-2014-10001.json");
        assert_eq!(files[1].filename, "CVE-2014-100009.json");
    }

    #[test]
    fn unchanged_directories_keep_their_tree_hash() {
        let build = |extra: Option<(&str, &str)>| {
            let mut files: BTreeMap<String, Vec<u8>> = [(
                "2021/0xxx/CVE-2021-0001.json".to_string(),
                b"{}".to_vec(),
            )]
            .into();
            if let Some((p, c)) = extra {
                files.insert(p.to_string(), c.as_bytes().to_vec());
            }
            let repo = MemRepo::new(files, Utc::now());
            let fs = repo_cve_files(&repo, repo.head_commit()).unwrap();
            fs.into_iter()
                .map(|f| (f.path(), f.tree_hash))
                .collect::<Vec<_>>()
        };
        let before = build(None);
        let after = build(Some(("2022/0xxx/CVE-2022-0001.json", "{}")));
        // The 2021 directory gained no files, so its tree hash is unchanged.
        assert_eq!(before[0], after[0]);
    }

    #[test]
    fn grouping_keeps_contiguous_runs() {
        let input = vec![
            file("a", "f1"),
            file("a", "f2"),
            file("b", "f1"),
            file("c", "f1"),
            file("c", "f2"),
        ];
        let groups = group_files_by_directory(input).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[2].len(), 2);
    }

    #[test]
    fn grouping_rejects_split_directories() {
        let input = vec![file("a", "f1"), file("b", "f1"), file("a", "f2")];
        let err = group_files_by_directory(input).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn blob_content_is_readable() {
        let repo = basic_repo();
        let files = repo_cve_files(&repo, repo.head_commit()).unwrap();
        let content = repo.blob(&files[0].blob_hash).unwrap();
        assert_eq!(content, b"{}");
    }
}
