use serde::{Deserialize, Serialize};

/// A project as advertised by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub git_repo: String,
    /// Git ref to check out after cloning; empty means the default branch
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub motd: String,
    #[serde(default)]
    pub public: bool,
}

impl Project {
    /// Sort projects so the most preferred one comes first.
    pub fn sort_by_priority(projects: &mut [Project]) {
        projects.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

/// A task leased from the coordinator. Never mutated after the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    #[serde(default)]
    pub priority: i64,
    pub project: Project,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub max_retries: i64,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub recipe: String,
    #[serde(default)]
    pub max_assign_time: i64,
    #[serde(default)]
    pub assign_time: i64,
    #[serde(default)]
    pub verification_count: i64,
}

/// Shape of the first argument handed to a recipe's `run` executable.
///
/// `project` is itself a JSON document embedded as a string; recipes decode it
/// separately.
#[derive(Serialize)]
struct RecipeArgument<'a> {
    id: i64,
    priority: i64,
    project: String,
    retries: i64,
    max_retries: i64,
    status: i64,
    recipe: &'a str,
    max_assign_time: i64,
    verification_count: i64,
}

impl Task {
    /// Encode the task the way `run` expects it on its command line.
    pub fn to_recipe_argument(&self) -> Result<String, serde_json::Error> {
        let argument = RecipeArgument {
            id: self.id,
            priority: self.priority,
            project: serde_json::to_string(&self.project)?,
            retries: self.retries,
            max_retries: self.max_retries,
            status: self.status,
            recipe: &self.recipe,
            max_assign_time: self.max_assign_time,
            verification_count: self.verification_count,
        };
        serde_json::to_string(&argument)
    }
}
