//! Normalisation des identifiants (noms de tables et de colonnes)

use std::sync::LazyLock;

use regex::Regex;

static NON_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9]+").expect("static pattern is valid"));

/// Transforme un nom distant en identifiant SQL : minuscules, séparateur `_`.
///
/// Deux noms distincts côté service peuvent donner le même identifiant
/// (`Shape.LEN` et `SHAPE_LEN`), d'où la déduplication faite à la découverte
/// des champs.
pub fn launder(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let slug = NON_IDENT.replace_all(&lowered, "_");
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "field".to_string()
    } else {
        slug.to_string()
    }
}

/// Échappe un identifiant pour l'inclure dans du SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
