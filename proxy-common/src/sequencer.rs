//! Token randomness statistics for the sequencer.
//!
//! Pure functions over a collected token sample: Shannon entropy against
//! the observed charset, structural pattern detection, and a summary
//! report with a rating and remediation hint.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerReport {
    pub sample_count: usize,
    pub average_length: f64,
    pub charset_size: usize,
    pub average_entropy: f64,
    pub max_entropy: f64,
    pub entropy_efficiency: f64,
    pub unique_ratio: f64,
    pub has_sequential_pattern: bool,
    pub has_repeated_values: bool,
    pub common_prefixes: Vec<String>,
    pub common_suffixes: Vec<String>,
    pub rating: String,
    pub recommendation: String,
}

/// Shannon entropy of a single token, in bits.
pub fn shannon_entropy(data: &str) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in data.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }
    let length = data.chars().count() as f64;
    freq.values()
        .map(|&count| {
            let p = count as f64 / length;
            -p * p.log2()
        })
        .sum()
}

/// Maximum entropy achievable for a charset of the given size and token
/// length, in bits.
pub fn max_entropy(charset_size: usize, length: usize) -> f64 {
    if charset_size == 0 || length == 0 {
        return 0.0;
    }
    (charset_size as f64).log2() * length as f64
}

/// Numeric or single-character-alphabetic arithmetic progressions over the
/// first tokens mark a predictable generator.
pub fn detect_sequential_pattern(tokens: &[String]) -> bool {
    if tokens.len() < 3 {
        return false;
    }
    let head: Vec<&String> = tokens.iter().take(10).collect();

    let nums: Vec<i64> = head.iter().filter_map(|t| t.parse::<i64>().ok()).collect();
    if nums.len() == head.len() && constant_difference(&nums) {
        return true;
    }

    if head.iter().all(|t| t.chars().count() == 1 && t.chars().all(|c| c.is_alphabetic())) {
        let ords: Vec<i64> = head
            .iter()
            .filter_map(|t| t.chars().next().map(|c| c as i64))
            .collect();
        if constant_difference(&ords) {
            return true;
        }
    }

    false
}

fn constant_difference(values: &[i64]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let diffs: HashSet<i64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    diffs.len() == 1
}

/// More than 10% duplicates counts as a repeated-value problem.
pub fn detect_repeated_values(tokens: &[String]) -> bool {
    if tokens.len() < 2 {
        return false;
    }
    let unique: HashSet<&String> = tokens.iter().collect();
    (unique.len() as f64) < (tokens.len() as f64) * 0.9
}

#[derive(Debug, Clone, Copy)]
pub enum Affix {
    Prefix,
    Suffix,
}

/// Affixes of length 2..=5 shared by at least half the tokens, longest
/// first, at most five.
pub fn common_affixes(tokens: &[String], affix: Affix) -> Vec<String> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokens {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() < 3 {
            continue;
        }
        for length in 2..chars.len().min(6) {
            let candidate: String = match affix {
                Affix::Prefix => chars[..length].iter().collect(),
                Affix::Suffix => chars[chars.len() - length..].iter().collect(),
            };
            *counts.entry(candidate).or_insert(0) += 1;
        }
    }
    let threshold = (tokens.len() + 1) / 2;
    let mut common: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(affix, _)| affix)
        .collect();
    common.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    common.truncate(5);
    common
}

pub fn entropy_rating(efficiency: f64) -> &'static str {
    if efficiency >= 0.9 {
        "Excellent"
    } else if efficiency >= 0.7 {
        "Good"
    } else if efficiency >= 0.5 {
        "Fair"
    } else {
        "Poor"
    }
}

pub fn recommendation(
    entropy_efficiency: f64,
    has_sequential: bool,
    has_repeated: bool,
    unique_ratio: f64,
) -> String {
    let mut issues = Vec::new();
    if entropy_efficiency < 0.5 {
        issues.push("Low entropy indicates predictable token generation");
    }
    if has_sequential {
        issues.push("Sequential patterns detected; tokens may be enumerable");
    }
    if has_repeated {
        issues.push("Repeated values detected; token space may be too small");
    }
    if unique_ratio < 0.9 {
        issues.push("High duplicate rate across the sample");
    }
    if issues.is_empty() {
        "Token generation appears to use a cryptographically adequate source.".to_string()
    } else {
        format!(
            "{}. Use a cryptographically secure random generator with at least 128 bits of entropy per token.",
            issues.join(". ")
        )
    }
}

/// Full analysis of a collected sample.
pub fn analyze(samples: &[String]) -> SequencerReport {
    let sample_count = samples.len();
    let charset: HashSet<char> = samples.iter().flat_map(|s| s.chars()).collect();
    let charset_size = charset.len();

    let average_length = if sample_count == 0 {
        0.0
    } else {
        samples.iter().map(|s| s.chars().count()).sum::<usize>() as f64 / sample_count as f64
    };

    let average_entropy = if sample_count == 0 {
        0.0
    } else {
        samples.iter().map(|s| shannon_entropy(s)).sum::<f64>() / sample_count as f64
    };

    // Per-token ceiling: log2(charset) * average token length.
    let max_entropy = max_entropy(charset_size, average_length.round() as usize);
    // A single token's measured entropy is bounded by log2(len); compare
    // against the charset ceiling for one position scaled to the length.
    let per_char_max = if charset_size > 0 {
        (charset_size as f64).log2()
    } else {
        0.0
    };
    let entropy_efficiency = if per_char_max > 0.0 {
        (average_entropy / per_char_max).min(1.0)
    } else {
        0.0
    };

    let unique: HashSet<&String> = samples.iter().collect();
    let unique_ratio = if sample_count == 0 {
        0.0
    } else {
        unique.len() as f64 / sample_count as f64
    };

    let has_sequential_pattern = detect_sequential_pattern(samples);
    let has_repeated_values = detect_repeated_values(samples);
    let common_prefixes = common_affixes(samples, Affix::Prefix);
    let common_suffixes = common_affixes(samples, Affix::Suffix);

    SequencerReport {
        sample_count,
        average_length,
        charset_size,
        average_entropy,
        max_entropy,
        entropy_efficiency,
        unique_ratio,
        has_sequential_pattern,
        has_repeated_values,
        common_prefixes,
        common_suffixes,
        rating: entropy_rating(entropy_efficiency).to_string(),
        recommendation: recommendation(
            entropy_efficiency,
            has_sequential_pattern,
            has_repeated_values,
            unique_ratio,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_uniform_string() {
        // Four distinct equally frequent characters: 2 bits per symbol.
        let entropy = shannon_entropy("abcdabcdabcd");
        assert!((entropy - 2.0).abs() < 1e-9);
    }

    #[test]
    fn entropy_of_constant_string_is_zero() {
        assert_eq!(shannon_entropy("aaaaaa"), 0.0);
        assert_eq!(shannon_entropy(""), 0.0);
    }

    #[test]
    fn sequential_numeric_tokens_detected() {
        let tokens: Vec<String> = (100..110).map(|n| n.to_string()).collect();
        assert!(detect_sequential_pattern(&tokens));

        let random = vec!["91".into(), "17".into(), "58".into(), "3".into()];
        assert!(!detect_sequential_pattern(&random));
    }

    #[test]
    fn repeated_values_detected() {
        let tokens: Vec<String> = vec!["tok".into(); 10];
        assert!(detect_repeated_values(&tokens));

        let distinct: Vec<String> = (0..10).map(|n| format!("t{}", n)).collect();
        assert!(!detect_repeated_values(&distinct));
    }

    #[test]
    fn common_prefix_extraction() {
        let tokens: Vec<String> = (0..8).map(|n| format!("sess_{:04}", n)).collect();
        let prefixes = common_affixes(&tokens, Affix::Prefix);
        assert!(prefixes.iter().any(|p| p == "sess_"));
    }

    #[test]
    fn analyze_flags_weak_tokens() {
        let tokens: Vec<String> = (1..=20).map(|n| n.to_string()).collect();
        let report = analyze(&tokens);
        assert!(report.has_sequential_pattern);
        assert!(report.recommendation.contains("Sequential"));
    }

    #[test]
    fn analyze_rates_strong_tokens_well() {
        // 16 hex chars drawn evenly: close to the charset ceiling.
        let tokens: Vec<String> = vec![
            "0123456789abcdef".into(),
            "fedcba9876543210".into(),
            "89abcdef01234567".into(),
        ];
        let report = analyze(&tokens);
        assert_eq!(report.charset_size, 16);
        assert!(report.entropy_efficiency > 0.9);
        assert_eq!(report.rating, "Excellent");
    }
}
