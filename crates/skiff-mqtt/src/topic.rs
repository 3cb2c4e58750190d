/// Whether `filter` is a well-formed topic filter: non-empty, `#` only as
/// the terminal segment, wildcards always alone in their segment.
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let segments: Vec<&str> = filter.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        match *seg {
            "#" if i != segments.len() - 1 => return false,
            s if s.contains('#') && s != "#" => return false,
            s if s.contains('+') && s != "+" => return false,
            _ => {}
        }
    }
    true
}

/// MQTT filter match: `+` matches exactly one segment, a terminal `#`
/// matches one or more remaining segments.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_segs: Vec<&str> = filter.split('/').collect();
    let topic_segs: Vec<&str> = topic.split('/').collect();

    for (i, seg) in filter_segs.iter().enumerate() {
        match *seg {
            "#" => return i == filter_segs.len() - 1 && topic_segs.len() > i,
            "+" => {
                if topic_segs.len() <= i {
                    return false;
                }
            }
            literal => {
                if topic_segs.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }
    filter_segs.len() == topic_segs.len()
}
