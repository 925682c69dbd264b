//! Environment ID generation: `<slug>/<adjective-noun>`.
//!
//! The slug comes from the user-supplied name; the random two-word suffix
//! disambiguates, so name collisions are allowed.

use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "cosmic", "eager", "fancy", "gentle", "happy", "jolly",
    "keen", "lively", "mellow", "nimble", "polite", "proud", "quiet", "rapid", "shiny", "sunny",
    "swift", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "crab", "falcon", "ferret", "finch", "gecko", "heron", "lemur", "lynx",
    "marmot", "newt", "otter", "owl", "panda", "pelican", "puffin", "quokka", "raven", "seal",
    "sparrow", "tapir", "walrus", "wren",
];

/// Sanitize a user-supplied name into a branch-safe slug: lowercase
/// alphanumerics with single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Generate a fresh ID for a (sanitized) name.
pub fn generate_id(name: &str) -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty word list");
    let noun = NOUNS.choose(&mut rng).expect("non-empty word list");
    format!("{}/{}-{}", slugify(name), adjective, noun)
}

/// Whether a branch name has the shape of a generated environment ID. Used
/// to tell environment branches apart from ordinary branches in the mirror.
pub fn is_environment_id(branch: &str) -> bool {
    let Some((slug, suffix)) = branch.rsplit_once('/') else {
        return false;
    };
    if slug.is_empty() {
        return false;
    }
    let Some((adjective, noun)) = suffix.split_once('-') else {
        return false;
    };
    ADJECTIVES.contains(&adjective) && NOUNS.contains(&noun)
}
