/// Prefix command recognised in a guild message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Play(Option<&'a str>),
    Stop,
    Skip,
    Queue,
    Unknown(&'a str),
}

/// Parses `content` as `<prefix><command> [args..]`.
///
/// Returns `None` when the message does not start with the prefix. Command
/// names are case-sensitive; extra arguments are ignored.
pub fn parse<'a>(prefix: &str, content: &'a str) -> Option<Command<'a>> {
    let rest = content.strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or("");

    Some(match name {
        "play" => Command::Play(words.next()),
        "stop" => Command::Stop,
        "skip" => Command::Skip,
        "queue" => Command::Queue,
        other => Command::Unknown(other),
    })
}
