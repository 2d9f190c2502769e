use std::net::IpAddr;

/// Session description with one motion-JPEG video track.
pub fn describe(local: IpAddr, session_name: &str) -> String {
    let family = match local {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };
    format!(
        "v=0\r\n\
         o=- 0 0 IN {family} {local}\r\n\
         s={session_name}\r\n\
         c=IN {family} {local}\r\n\
         t=0 0\r\n\
         m=video 0 RTP/AVP 26\r\n\
         a=control:track1\r\n"
    )
}
