fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// TwiML that connects the call to a bidirectional media stream at `url`.
///
/// `parameters` are handed to the stream and come back as the custom
/// parameters of its `start` message.
pub fn connect_stream(url: &str, parameters: &[(&str, &str)]) -> String {
    let stream = if parameters.is_empty() {
        format!("<Stream url=\"{}\" />", escape_attribute(url))
    } else {
        let parameters: String = parameters
            .iter()
            .map(|(name, value)| {
                format!(
                    "<Parameter name=\"{}\" value=\"{}\" />",
                    escape_attribute(name),
                    escape_attribute(value)
                )
            })
            .collect();
        format!("<Stream url=\"{}\">{parameters}</Stream>", escape_attribute(url))
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect>{stream}</Connect></Response>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_stream_points_at_the_websocket() {
        assert_eq!(
            connect_stream("wss://voice.example.com/connection", &[]),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect><Stream url=\"wss://voice.example.com/connection\" /></Connect></Response>"
        );
    }

    #[test]
    fn attribute_is_escaped() {
        assert!(connect_stream("wss://a/b?x=1&y=\"2\"", &[]).contains("x=1&amp;y=&quot;2&quot;"));
    }

    #[test]
    fn parameters_are_nested_in_the_stream() {
        assert_eq!(
            connect_stream("wss://voice.example.com/connection", &[("from", "+15550100")]),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect><Stream url=\"wss://voice.example.com/connection\"><Parameter name=\"from\" value=\"+15550100\" /></Stream></Connect></Response>"
        );
    }
}
