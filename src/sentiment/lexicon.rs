// =============================================================================
// Lexicon scorer — deterministic text sentiment in [-1, 1]
// =============================================================================
//
// Small domain lexicon tuned for crypto chatter. Each token hit contributes
// +1/-1; negation within a two-token lookbehind flips the contribution. The
// text score is the normalised net over all hits.
// =============================================================================

const POSITIVE: &[&str] = &[
    "bullish", "moon", "pump", "rally", "breakout", "surge", "gain", "gains", "profit", "ath",
    "uptrend", "buy", "accumulate", "long", "support", "strong", "adoption", "approval",
    "partnership", "upgrade", "green", "recover", "recovery", "soar", "win",
];

const NEGATIVE: &[&str] = &[
    "bearish", "dump", "crash", "selloff", "plunge", "loss", "losses", "scam", "hack", "rug",
    "downtrend", "sell", "short", "resistance", "weak", "ban", "rejection", "lawsuit", "fud",
    "red", "collapse", "liquidation", "fear", "panic", "exploit",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "isnt", "wont", "dont", "cant"];

/// Score a single text. Returns 0.0 for text without any lexicon hits.
pub fn score_text(text: &str) -> f64 {
    let tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();

    let mut net = 0.0_f64;
    let mut hits = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        let polarity = if POSITIVE.contains(&token.as_str()) {
            1.0
        } else if NEGATIVE.contains(&token.as_str()) {
            -1.0
        } else {
            continue;
        };

        // Negation in the two preceding tokens flips the hit.
        let negated = tokens[i.saturating_sub(2)..i]
            .iter()
            .any(|t| NEGATIONS.contains(&t.as_str()));

        net += if negated { -polarity } else { polarity };
        hits += 1;
    }

    if hits == 0 {
        0.0
    } else {
        (net / hits as f64).clamp(-1.0, 1.0)
    }
}

/// Score a batch of texts: (mean score over scored texts, texts with hits).
pub fn score_batch(texts: &[String]) -> (f64, usize) {
    let scores: Vec<f64> = texts
        .iter()
        .map(|t| score_text(t))
        .filter(|s| *s != 0.0)
        .collect();

    if scores.is_empty() {
        (0.0, 0)
    } else {
        (scores.iter().sum::<f64>() / scores.len() as f64, scores.len())
    }
}
