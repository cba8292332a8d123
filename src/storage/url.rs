//! 远端 URL 拼接与转义

/// 拼接 URL 片段，去掉各片段首尾多余的 `/`，忽略空片段
pub fn join_url<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts: Vec<S> = parts.into_iter().collect();
    let result = parts
        .iter()
        .map(|p| p.as_ref().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if result.is_empty() && parts.iter().any(|p| p.as_ref().contains('/')) {
        return "/".to_string();
    }

    result
}

/// 按段转义路径，保留 `/` 分隔符
pub fn quote_path(value: &str) -> String {
    value
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 规范化远端返回的相对路径：统一为 `/` 分隔，去掉空段和 `.` 段
pub fn normalize_key(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}
