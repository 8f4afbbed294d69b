/// Matches a routing key against a topic-exchange binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
#[must_use]
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            matches_words(rest, key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => matches_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && matches_words(rest, key_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_keys() {
        assert!(routing_key_matches("weather", "weather"));
        assert!(!routing_key_matches("weather", "sports"));
        assert!(!routing_key_matches("weather", "weather.today"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(routing_key_matches("topic.*", "topic.weather"));
        assert!(!routing_key_matches("topic.*", "topic"));
        assert!(!routing_key_matches("topic.*", "topic.weather.today"));
    }

    #[test]
    fn test_hash_matches_any_number_of_words() {
        assert!(routing_key_matches("#", "weather"));
        assert!(routing_key_matches("topic.#", "topic"));
        assert!(routing_key_matches("topic.#", "topic.weather.today"));
        assert!(routing_key_matches("#.today", "topic.weather.today"));
        assert!(!routing_key_matches("topic.#", "news.weather"));
    }
}
