//! GraphQL documents sent to `api.github.com/graphql`.

pub const VIEWER_LOGIN: &str = "query { viewer { login } }";

pub const RATE_LIMIT: &str = "query { rateLimit { limit cost remaining resetAt } }";

pub const REPOSITORY_SNAPSHOT: &str = r#"query RepoSnapshot($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    nameWithOwner
    description
    stargazerCount
    forkCount
    url
    pushedAt
    defaultBranchRef { name }
    owner { login avatarUrl }
    licenseInfo { name }
    issues(states: OPEN) { totalCount }
    repositoryTopics(first: 4) { nodes { topic { name } } }
    latestRelease: releases(first: 5, orderBy: {field: CREATED_AT, direction: DESC}) {
      nodes { id tagName url description publishedAt }
    }
    languages(first: 3, orderBy: {field: SIZE, direction: DESC}) {
      totalSize
      edges { size node { name } }
    }
  }
}"#;

/// Build one query that asks for the newest release id of every repo, each
/// under an alias `repo{i}`. Returns the document and its variables.
pub fn batch_latest_release(repos: &[(&str, &str)]) -> (String, serde_json::Value) {
    let mut params = Vec::with_capacity(repos.len() * 2);
    let mut fields = String::new();
    let mut variables = serde_json::Map::new();

    for (i, (owner, name)) in repos.iter().enumerate() {
        params.push(format!("$owner{i}: String!"));
        params.push(format!("$name{i}: String!"));
        fields.push_str(&format!(
            "  repo{i}: repository(owner: $owner{i}, name: $name{i}) {{\n    \
             nameWithOwner\n    \
             latestRelease: releases(first: 1, orderBy: {{field: CREATED_AT, direction: DESC}}) {{ nodes {{ id }} }}\n  }}\n"
        ));
        variables.insert(format!("owner{i}"), (*owner).into());
        variables.insert(format!("name{i}"), (*name).into());
    }

    let query = format!(
        "query BatchLatestRelease({}) {{\n{fields}}}",
        params.join(", ")
    );
    (query, serde_json::Value::Object(variables))
}
