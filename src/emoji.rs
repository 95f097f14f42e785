use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Shortcodes the local platform understands, paired with the unicode
/// sequence the remote platform renders. The first shortcode listed for a
/// codepoint is the canonical one used when translating back.
const EMOJIS: &[(&str, &str)] = &[
    ("+1", "👍"),
    ("thumbsup", "👍"),
    ("-1", "👎"),
    ("thumbsdown", "👎"),
    ("smile", "😄"),
    ("smiley", "😃"),
    ("grinning", "😀"),
    ("grin", "😁"),
    ("laughing", "😆"),
    ("satisfied", "😆"),
    ("joy", "😂"),
    ("rofl", "🤣"),
    ("sweat_smile", "😅"),
    ("slightly_smiling_face", "🙂"),
    ("upside_down_face", "🙃"),
    ("wink", "😉"),
    ("blush", "😊"),
    ("innocent", "😇"),
    ("heart_eyes", "😍"),
    ("kissing_heart", "😘"),
    ("yum", "😋"),
    ("stuck_out_tongue", "😛"),
    ("stuck_out_tongue_winking_eye", "😜"),
    ("thinking", "🤔"),
    ("thinking_face", "🤔"),
    ("neutral_face", "😐"),
    ("expressionless", "😑"),
    ("no_mouth", "😶"),
    ("smirk", "😏"),
    ("unamused", "😒"),
    ("roll_eyes", "🙄"),
    ("grimacing", "😬"),
    ("relieved", "😌"),
    ("pensive", "😔"),
    ("sleepy", "😪"),
    ("sleeping", "😴"),
    ("mask", "😷"),
    ("nerd_face", "🤓"),
    ("sunglasses", "😎"),
    ("confused", "😕"),
    ("worried", "😟"),
    ("slightly_frowning_face", "🙁"),
    ("open_mouth", "😮"),
    ("hushed", "😯"),
    ("astonished", "😲"),
    ("flushed", "😳"),
    ("fearful", "😨"),
    ("cold_sweat", "😰"),
    ("cry", "😢"),
    ("sob", "😭"),
    ("scream", "😱"),
    ("tired_face", "😫"),
    ("angry", "😠"),
    ("rage", "😡"),
    ("skull", "💀"),
    ("poop", "💩"),
    ("hankey", "💩"),
    ("clown_face", "🤡"),
    ("ghost", "👻"),
    ("alien", "👽"),
    ("robot", "🤖"),
    ("see_no_evil", "🙈"),
    ("hear_no_evil", "🙉"),
    ("speak_no_evil", "🙊"),
    ("heart", "❤️"),
    ("orange_heart", "🧡"),
    ("yellow_heart", "💛"),
    ("green_heart", "💚"),
    ("blue_heart", "💙"),
    ("purple_heart", "💜"),
    ("black_heart", "🖤"),
    ("broken_heart", "💔"),
    ("sparkling_heart", "💖"),
    ("100", "💯"),
    ("boom", "💥"),
    ("collision", "💥"),
    ("dizzy", "💫"),
    ("wave", "👋"),
    ("raised_hand", "✋"),
    ("ok_hand", "👌"),
    ("v", "✌️"),
    ("crossed_fingers", "🤞"),
    ("point_up", "☝️"),
    ("point_left", "👈"),
    ("point_right", "👉"),
    ("point_down", "👇"),
    ("fist", "✊"),
    ("punch", "👊"),
    ("clap", "👏"),
    ("raised_hands", "🙌"),
    ("open_hands", "👐"),
    ("pray", "🙏"),
    ("handshake", "🤝"),
    ("muscle", "💪"),
    ("eyes", "👀"),
    ("brain", "🧠"),
    ("tada", "🎉"),
    ("confetti_ball", "🎊"),
    ("balloon", "🎈"),
    ("gift", "🎁"),
    ("trophy", "🏆"),
    ("medal", "🏅"),
    ("fire", "🔥"),
    ("star", "⭐"),
    ("star2", "🌟"),
    ("sparkles", "✨"),
    ("zap", "⚡"),
    ("sunny", "☀️"),
    ("cloud", "☁️"),
    ("umbrella", "☔"),
    ("snowflake", "❄️"),
    ("rainbow", "🌈"),
    ("rocket", "🚀"),
    ("airplane", "✈️"),
    ("car", "🚗"),
    ("coffee", "☕"),
    ("beer", "🍺"),
    ("beers", "🍻"),
    ("wine_glass", "🍷"),
    ("pizza", "🍕"),
    ("hamburger", "🍔"),
    ("cake", "🍰"),
    ("birthday", "🎂"),
    ("apple", "🍎"),
    ("dog", "🐶"),
    ("cat", "🐱"),
    ("unicorn", "🦄"),
    ("bug", "🐛"),
    ("penguin", "🐧"),
    ("computer", "💻"),
    ("keyboard", "⌨️"),
    ("bulb", "💡"),
    ("memo", "📝"),
    ("pencil", "📝"),
    ("calendar", "📆"),
    ("clipboard", "📋"),
    ("pushpin", "📌"),
    ("paperclip", "📎"),
    ("lock", "🔒"),
    ("unlock", "🔓"),
    ("key", "🔑"),
    ("hammer", "🔨"),
    ("wrench", "🔧"),
    ("gear", "⚙️"),
    ("link", "🔗"),
    ("bell", "🔔"),
    ("mega", "📣"),
    ("email", "📧"),
    ("hourglass", "⌛"),
    ("watch", "⌚"),
    ("alarm_clock", "⏰"),
    ("white_check_mark", "✅"),
    ("heavy_check_mark", "✔️"),
    ("ballot_box_with_check", "☑️"),
    ("x", "❌"),
    ("negative_squared_cross_mark", "❎"),
    ("warning", "⚠️"),
    ("no_entry", "⛔"),
    ("question", "❓"),
    ("exclamation", "❗"),
    ("heavy_plus_sign", "➕"),
    ("heavy_minus_sign", "➖"),
    ("arrow_up", "⬆️"),
    ("arrow_down", "⬇️"),
    ("arrow_right", "➡️"),
    ("arrow_left", "⬅️"),
    ("recycle", "♻️"),
    ("red_circle", "🔴"),
    ("large_blue_circle", "🔵"),
    ("white_circle", "⚪"),
    ("black_circle", "⚫"),
];

/// Names the remote platform used for its built-in reactions before it
/// switched to unicode reaction types.
const LEGACY_REACTIONS: &[(&str, &str)] = &[
    ("like", "+1"),
    ("heart", "heart"),
    ("laugh", "laughing"),
    ("surprised", "open_mouth"),
    ("sad", "cry"),
    ("angry", "angry"),
    ("checkmarkbutton", "white_check_mark"),
];

static BY_SHORTCODE: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| EMOJIS.iter().copied().collect());

static BY_UNICODE: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (name, unicode) in EMOJIS {
        map.entry(*unicode).or_insert(*name);
        map.entry(unicode.trim_end_matches('\u{fe0f}')).or_insert(*name);
    }
    map
});

static SHORTCODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([a-z0-9_+\-]+):").expect("valid emoji shortcode regex"));

pub fn shortcode_to_unicode(name: &str) -> Option<&'static str> {
    BY_SHORTCODE.get(name.trim_matches(':')).copied()
}

pub fn unicode_to_shortcode(unicode: &str) -> Option<&'static str> {
    BY_UNICODE
        .get(unicode)
        .or_else(|| BY_UNICODE.get(unicode.trim_end_matches('\u{fe0f}')))
        .copied()
}

/// Replaces known `:shortcode:` tokens with their unicode form; unknown
/// shortcodes are left as written.
pub fn replace_shortcodes(text: &str) -> String {
    if !text.contains(':') {
        return text.to_string();
    }
    SHORTCODE_REGEX
        .replace_all(text, |caps: &regex::Captures| {
            shortcode_to_unicode(&caps[1])
                .map(str::to_string)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Local emoji name for a remote reaction type, which is either a unicode
/// sequence or one of the legacy reaction names.
pub fn remote_reaction_to_local(reaction_type: &str) -> Option<String> {
    if let Some((_, name)) = LEGACY_REACTIONS
        .iter()
        .find(|(legacy, _)| legacy.eq_ignore_ascii_case(reaction_type))
    {
        return Some((*name).to_string());
    }
    unicode_to_shortcode(reaction_type).map(str::to_string)
}

/// Remote reaction type for a local emoji name. Custom emoji without a
/// unicode form are not representable remotely.
pub fn local_reaction_to_remote(emoji_name: &str) -> Option<&'static str> {
    shortcode_to_unicode(emoji_name)
}
