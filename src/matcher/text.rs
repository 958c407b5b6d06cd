//! Question-text pipeline: synonym folding, tokenization, Porter stemming,
//! and the Jaccard / TF-IDF similarity primitives.
//!
//! The pipeline is deterministic: the same market set always produces the
//! same scores, so a matcher re-run is byte-identical.

use rustc_hash::{FxHashMap, FxHashSet};

/// Words carrying no matching signal in market questions.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "for", "if", "in", "is", "it", "of", "on", "or",
    "than", "that", "the", "this", "to", "who", "whom", "will", "would",
];

/// Domain lexicon: entity aliases folded to one canonical token before
/// stemming. Multi-word phrases first (longest match), then single tokens.
fn phrase_aliases() -> &'static [(&'static str, &'static str)] {
    &[
        ("donald trump", "trump"),
        ("donald j trump", "trump"),
        ("joe biden", "biden"),
        ("joseph biden", "biden"),
        ("kamala harris", "harris"),
        ("federal reserve", "fed"),
        ("interest rate", "rates"),
        ("interest rates", "rates"),
        ("united states", "us"),
        ("supreme court", "scotus"),
        ("prime minister", "pm"),
        ("world cup", "worldcup"),
        ("super bowl", "superbowl"),
        ("electoral college", "electoralcollege"),
        ("will not", "not"),
    ]
}

fn token_aliases() -> &'static [(&'static str, &'static str)] {
    &[
        ("btc", "bitcoin"),
        ("xbt", "bitcoin"),
        ("eth", "ethereum"),
        ("sol", "solana"),
        ("doge", "dogecoin"),
        ("djt", "trump"),
        ("gop", "republican"),
        ("republicans", "republican"),
        ("democrats", "democrat"),
        ("dems", "democrat"),
        ("potus", "president"),
        ("fomc", "fed"),
        ("sec", "sec"),
        ("cpi", "inflation"),
        ("wont", "not"),
        ("never", "not"),
        ("jan", "january"),
        ("feb", "february"),
        ("mar", "march"),
        ("apr", "april"),
        ("jun", "june"),
        ("jul", "july"),
        ("aug", "august"),
        ("sep", "september"),
        ("sept", "september"),
        ("oct", "october"),
        ("nov", "november"),
        ("dec", "december"),
    ]
}

/// Full pipeline: lowercase, fold synonyms, tokenize, drop stopwords, stem.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut lowered = text.to_lowercase();
    for (phrase, canonical) in phrase_aliases() {
        if lowered.contains(phrase) {
            lowered = lowered.replace(phrase, canonical);
        }
    }

    let alias_map: FxHashMap<&str, &str> = token_aliases().iter().copied().collect();

    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| *alias_map.get(token).unwrap_or(&token))
        .filter(|token| !STOPWORDS.contains(token))
        .map(|token| {
            if token.chars().all(|c| c.is_ascii_digit()) {
                token.to_string()
            } else {
                porter_stem(token)
            }
        })
        .collect()
}

/// Jaccard similarity over the token sets.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let set_a: FxHashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let set_b: FxHashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Stemmed terms present in both token lists, sorted for stable output.
pub fn shared_terms(a: &[String], b: &[String]) -> Vec<String> {
    let set_b: FxHashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let mut shared: Vec<String> = a
        .iter()
        .filter(|token| set_b.contains(token.as_str()))
        .cloned()
        .collect::<FxHashSet<_>>()
        .into_iter()
        .collect();
    shared.sort();
    shared
}

/// Inverse document frequencies over one matching run's question corpus.
pub struct IdfModel {
    idf: FxHashMap<String, f64>,
    default_idf: f64,
}

impl IdfModel {
    /// `idf(t) = ln(1 + N / (1 + df(t)))`; terms unseen in the corpus get
    /// the maximum weight.
    pub fn build<'a, I>(docs: I) -> Self
    where
        I: IntoIterator<Item = &'a Vec<String>>,
    {
        let mut df: FxHashMap<String, usize> = FxHashMap::default();
        let mut n_docs = 0usize;
        for doc in docs {
            n_docs += 1;
            let unique: FxHashSet<&str> = doc.iter().map(|s| s.as_str()).collect();
            for term in unique {
                *df.entry(term.to_string()).or_insert(0) += 1;
            }
        }

        let n = n_docs.max(1) as f64;
        let idf = df
            .into_iter()
            .map(|(term, count)| (term, (1.0 + n / (1.0 + count as f64)).ln()))
            .collect();
        Self {
            idf,
            default_idf: (1.0 + n).ln(),
        }
    }

    fn weight(&self, term: &str) -> f64 {
        *self.idf.get(term).unwrap_or(&self.default_idf)
    }

    /// Cosine similarity of the TF-IDF vectors of two token lists.
    ///
    /// Terms accumulate in sorted order so the result is bit-identical
    /// across runs and symmetric in its arguments.
    pub fn cosine(&self, a: &[String], b: &[String]) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        fn tf(tokens: &[String]) -> std::collections::BTreeMap<&str, f64> {
            let mut counts: std::collections::BTreeMap<&str, f64> = std::collections::BTreeMap::new();
            for token in tokens {
                *counts.entry(token.as_str()).or_insert(0.0) += 1.0;
            }
            let len = tokens.len() as f64;
            for value in counts.values_mut() {
                *value /= len;
            }
            counts
        }

        let tf_a = tf(a);
        let tf_b = tf(b);

        let mut dot = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;
        for (term, &tfa) in &tf_a {
            let w = self.weight(term);
            let wa = tfa * w;
            norm_a += wa * wa;
            if let Some(&tfb) = tf_b.get(term) {
                dot += wa * (tfb * w);
            }
        }
        for (term, &tfb) in &tf_b {
            let wb = tfb * self.weight(term);
            norm_b += wb * wb;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
        }
    }
}

/// Blended semantic score: `0.4 · Jaccard + 0.6 · cosine-TFIDF`.
pub fn semantic_score(idf: &IdfModel, a: &[String], b: &[String]) -> f64 {
    0.4 * jaccard(a, b) + 0.6 * idf.cosine(a, b)
}

// === Porter stemmer ===

fn is_consonant(word: &[u8], i: usize) -> bool {
    match word[i] {
        b'a' | b'e' | b'i' | b'o' | b'u' => false,
        b'y' => i == 0 || !is_consonant(word, i - 1),
        _ => true,
    }
}

/// Porter's measure: the number of VC sequences in the stem.
fn measure(word: &[u8]) -> usize {
    let mut m = 0;
    let mut i = 0;
    let n = word.len();

    while i < n && is_consonant(word, i) {
        i += 1;
    }
    while i < n {
        while i < n && !is_consonant(word, i) {
            i += 1;
        }
        if i == n {
            break;
        }
        m += 1;
        while i < n && is_consonant(word, i) {
            i += 1;
        }
    }
    m
}

fn contains_vowel(word: &[u8]) -> bool {
    (0..word.len()).any(|i| !is_consonant(word, i))
}

fn ends_double_consonant(word: &[u8]) -> bool {
    let n = word.len();
    n >= 2 && word[n - 1] == word[n - 2] && is_consonant(word, n - 1)
}

/// `*o` condition: stem ends cvc where the final c is not w, x or y.
fn ends_cvc(word: &[u8]) -> bool {
    let n = word.len();
    n >= 3
        && is_consonant(word, n - 3)
        && !is_consonant(word, n - 2)
        && is_consonant(word, n - 1)
        && !matches!(word[n - 1], b'w' | b'x' | b'y')
}

/// Apply `suffix -> replacement` when the stem's measure allows it. Returns
/// true when the suffix matched at all: per Porter, a matched suffix ends the
/// step even if its condition failed.
fn replace_suffix(word: &mut Vec<u8>, suffix: &str, replacement: &str, min_measure: usize) -> bool {
    let suffix = suffix.as_bytes();
    if word.len() <= suffix.len() || !word.ends_with(suffix) {
        return false;
    }
    let stem_len = word.len() - suffix.len();
    if measure(&word[..stem_len]) >= min_measure {
        word.truncate(stem_len);
        word.extend_from_slice(replacement.as_bytes());
    }
    true
}

/// Porter stemming for lowercase ASCII words; non-ASCII input is returned
/// unchanged.
pub fn porter_stem(token: &str) -> String {
    if !token.is_ascii() || token.len() <= 2 {
        return token.to_string();
    }
    let mut word = token.as_bytes().to_vec();

    // Step 1a
    if word.ends_with(b"sses") {
        word.truncate(word.len() - 2);
    } else if word.ends_with(b"ies") {
        word.truncate(word.len() - 2);
    } else if !word.ends_with(b"ss") && word.ends_with(b"s") {
        word.truncate(word.len() - 1);
    }

    // Step 1b
    let mut cleanup = false;
    if word.ends_with(b"eed") {
        if measure(&word[..word.len() - 3]) > 0 {
            word.truncate(word.len() - 1);
        }
    } else if word.ends_with(b"ed") && contains_vowel(&word[..word.len() - 2]) {
        word.truncate(word.len() - 2);
        cleanup = true;
    } else if word.ends_with(b"ing") && contains_vowel(&word[..word.len() - 3]) {
        word.truncate(word.len() - 3);
        cleanup = true;
    }
    if cleanup {
        if word.ends_with(b"at") || word.ends_with(b"bl") || word.ends_with(b"iz") {
            word.push(b'e');
        } else if ends_double_consonant(&word)
            && !matches!(word.last(), Some(&b'l') | Some(&b's') | Some(&b'z'))
        {
            word.truncate(word.len() - 1);
        } else if measure(&word) == 1 && ends_cvc(&word) {
            word.push(b'e');
        }
    }

    // Step 1c
    if word.ends_with(b"y") && contains_vowel(&word[..word.len() - 1]) {
        let n = word.len();
        word[n - 1] = b'i';
    }

    // Step 2
    for (suffix, replacement) in [
        ("ational", "ate"),
        ("tional", "tion"),
        ("enci", "ence"),
        ("anci", "ance"),
        ("izer", "ize"),
        ("abli", "able"),
        ("alli", "al"),
        ("entli", "ent"),
        ("eli", "e"),
        ("ousli", "ous"),
        ("ization", "ize"),
        ("ation", "ate"),
        ("ator", "ate"),
        ("alism", "al"),
        ("iveness", "ive"),
        ("fulness", "ful"),
        ("ousness", "ous"),
        ("aliti", "al"),
        ("iviti", "ive"),
        ("biliti", "ble"),
    ] {
        if replace_suffix(&mut word, suffix, replacement, 1) {
            break;
        }
    }

    // Step 3
    for (suffix, replacement) in [
        ("icate", "ic"),
        ("ative", ""),
        ("alize", "al"),
        ("iciti", "ic"),
        ("ical", "ic"),
        ("ful", ""),
        ("ness", ""),
    ] {
        if replace_suffix(&mut word, suffix, replacement, 1) {
            break;
        }
    }

    // Step 4
    let step4 = [
        "al", "ance", "ence", "er", "ic", "able", "ible", "ant", "ement", "ment", "ent", "ou",
        "ism", "ate", "iti", "ous", "ive", "ize",
    ];
    let mut removed = false;
    for suffix in step4 {
        let bytes = suffix.as_bytes();
        if word.ends_with(bytes) && measure(&word[..word.len() - bytes.len()]) > 1 {
            word.truncate(word.len() - bytes.len());
            removed = true;
            break;
        }
    }
    if !removed && word.ends_with(b"ion") {
        let stem_len = word.len() - 3;
        if measure(&word[..stem_len]) > 1
            && matches!(word.get(stem_len.wrapping_sub(1)), Some(&b's') | Some(&b't'))
        {
            word.truncate(stem_len);
        }
    }

    // Step 5a
    if word.ends_with(b"e") {
        let stem = &word[..word.len() - 1];
        let m = measure(stem);
        if m > 1 || (m == 1 && !ends_cvc(stem)) {
            word.truncate(word.len() - 1);
        }
    }
    // Step 5b
    if measure(&word) > 1 && word.ends_with(b"ll") {
        word.truncate(word.len() - 1);
    }

    String::from_utf8(word).unwrap_or_else(|_| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porter_known_pairs() {
        assert_eq!(porter_stem("caresses"), "caress");
        assert_eq!(porter_stem("ponies"), "poni");
        assert_eq!(porter_stem("cats"), "cat");
        assert_eq!(porter_stem("running"), "run");
        assert_eq!(porter_stem("matched"), "match");
        assert_eq!(porter_stem("elections"), "elect");
        assert_eq!(porter_stem("win"), "win");
    }

    #[test]
    fn tokenize_folds_and_stems() {
        let tokens = tokenize("Will Donald Trump win the 2024 Presidential Election?");
        assert!(tokens.contains(&"trump".to_string()));
        assert!(tokens.contains(&"2024".to_string()));
        assert!(tokens.contains(&"elect".to_string()));
        assert!(tokens.contains(&"win".to_string()));
        // Stopwords are gone.
        assert!(!tokens.contains(&"will".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
    }

    #[test]
    fn tokenize_applies_token_aliases() {
        let tokens = tokenize("BTC above $100k by Dec 31?");
        assert!(tokens.contains(&"bitcoin".to_string()));
        assert!(tokens.contains(&"december".to_string()));
    }

    #[test]
    fn equivalent_questions_tokenize_identically() {
        let a = tokenize("Will Donald Trump win the 2024 election?");
        let b = tokenize("Will Trump win the 2024 election?");
        assert_eq!(a, b);
    }

    #[test]
    fn jaccard_bounds() {
        let a = tokenize("bitcoin above 100k in 2024");
        let b = tokenize("bitcoin above 100k in 2024");
        assert!((jaccard(&a, &b) - 1.0).abs() < 1e-12);

        let c = tokenize("ethereum below 1k");
        let j = jaccard(&a, &c);
        assert!((0.0..1.0).contains(&j));
    }

    #[test]
    fn cosine_identical_is_one() {
        let docs = vec![
            tokenize("Will Trump win the 2024 election?"),
            tokenize("Will Bitcoin reach 100k in 2024?"),
            tokenize("Will the Fed cut rates in March?"),
        ];
        let idf = IdfModel::build(&docs);
        let sim = idf.cosine(&docs[0], &docs[0]);
        assert!((sim - 1.0).abs() < 1e-9);

        let cross = idf.cosine(&docs[0], &docs[1]);
        assert!(cross < 0.6);
    }

    #[test]
    fn semantic_score_blend_is_deterministic() {
        let a = tokenize("Will Trump win the 2024 presidential election?");
        let b = tokenize("Trump to win 2024 US presidential election");
        let docs = vec![a.clone(), b.clone()];
        let idf = IdfModel::build(&docs);

        let s1 = semantic_score(&idf, &a, &b);
        let s2 = semantic_score(&idf, &a, &b);
        assert_eq!(s1.to_bits(), s2.to_bits());
        assert!(s1 > 0.5, "expected strong similarity, got {}", s1);
    }

    #[test]
    fn shared_terms_sorted_and_unique() {
        let a = tokenize("Trump wins 2024 election in November");
        let b = tokenize("Will Trump win the November 2024 election?");
        let shared = shared_terms(&a, &b);
        assert!(shared.contains(&"trump".to_string()));
        assert!(shared.contains(&"2024".to_string()));
        let mut sorted = shared.clone();
        sorted.sort();
        assert_eq!(shared, sorted);
    }
}
