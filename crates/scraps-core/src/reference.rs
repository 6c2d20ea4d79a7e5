use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("invalid reference: expected store/repo[:branch], got {input:?}")]
    Malformed { input: String },
    #[error("branch is required (use store/repo:branch format)")]
    BranchRequired,
}

/// A parsed `store/repo[:branch]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub store: String,
    pub repo: String,
    pub branch: Option<String>,
}

/// A reference that is guaranteed to name a branch; claims are scoped to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub store: String,
    pub repo: String,
    pub branch: String,
}

impl RepoRef {
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let malformed = || ReferenceError::Malformed {
            input: input.to_owned(),
        };

        let (store_repo, branch) = match input.split_once(':') {
            Some((head, branch)) => (head, Some(branch)),
            None => (input, None),
        };

        let (store, repo) = store_repo.split_once('/').ok_or_else(malformed)?;
        if store.trim().is_empty() || repo.trim().is_empty() {
            return Err(malformed());
        }

        let branch = branch
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_owned);

        Ok(Self {
            store: store.to_owned(),
            repo: repo.to_owned(),
            branch,
        })
    }

    /// Uses `fallback` when the reference itself did not name a branch.
    pub fn or_branch(self, fallback: Option<String>) -> Self {
        if self.branch.is_some() {
            return self;
        }
        Self {
            branch: fallback.filter(|b| !b.trim().is_empty()),
            ..self
        }
    }

    pub fn require_branch(self) -> Result<BranchRef, ReferenceError> {
        let branch = self.branch.ok_or(ReferenceError::BranchRequired)?;
        Ok(BranchRef {
            store: self.store,
            repo: self.repo,
            branch,
        })
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.repo)?;
        if let Some(branch) = &self.branch {
            write!(f, ":{branch}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.store, self.repo, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_repo_and_optional_branch() {
        let r = RepoRef::parse("acme/web").unwrap();
        assert_eq!(r.store, "acme");
        assert_eq!(r.repo, "web");
        assert_eq!(r.branch, None);

        let r = RepoRef::parse("acme/web:main").unwrap();
        assert_eq!(r.branch.as_deref(), Some("main"));
        assert_eq!(r.to_string(), "acme/web:main");
    }

    #[test]
    fn repo_keeps_extra_slashes_and_branch_keeps_colons() {
        let r = RepoRef::parse("acme/web/app:feat:x").unwrap();
        assert_eq!(r.repo, "web/app");
        assert_eq!(r.branch.as_deref(), Some("feat:x"));
    }

    #[test]
    fn rejects_missing_repo() {
        let err = RepoRef::parse("acme").unwrap_err();
        assert_eq!(
            err,
            ReferenceError::Malformed {
                input: "acme".to_owned()
            }
        );
        assert!(RepoRef::parse("/web").is_err());
        assert!(RepoRef::parse("acme/:main").is_err());
    }

    #[test]
    fn require_branch_fails_without_branch() {
        let err = RepoRef::parse("acme/web")
            .unwrap()
            .require_branch()
            .unwrap_err();
        assert_eq!(err, ReferenceError::BranchRequired);

        let b = RepoRef::parse("acme/web:")
            .unwrap()
            .or_branch(Some("dev".to_owned()))
            .require_branch()
            .unwrap();
        assert_eq!(b.to_string(), "acme/web:dev");

        let r = RepoRef::parse("acme/web:main")
            .unwrap()
            .or_branch(Some("dev".to_owned()));
        assert_eq!(r.branch.as_deref(), Some("main"));
    }
}
