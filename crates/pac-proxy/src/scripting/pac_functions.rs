//! The PAC helper library evaluated ahead of every routing script.
//!
//! These follow the Netscape PAC definitions. Helpers that need a resolver
//! (`dnsResolve`, `myIpAddress`, `isResolvable`) are left out so a decision
//! never blocks on the network; `isInNet` therefore only matches hosts that
//! are already IPv4 literals.

pub const PAC_FUNCTIONS: &str = r#"
function isPlainHostName(host) {
    return String(host).indexOf('.') === -1;
}

function dnsDomainIs(host, domain) {
    host = String(host).toLowerCase();
    domain = String(domain).toLowerCase();
    return host.length >= domain.length &&
        host.substring(host.length - domain.length) === domain;
}

function localHostOrDomainIs(host, hostdom) {
    host = String(host).toLowerCase();
    hostdom = String(hostdom).toLowerCase();
    return host === hostdom || hostdom.lastIndexOf(host + '.', 0) === 0;
}

function dnsDomainLevels(host) {
    return String(host).split('.').length - 1;
}

function shExpMatch(str, shexp) {
    var pattern = String(shexp)
        .replace(/[.+^${}()|[\]\\]/g, '\\$&')
        .replace(/\*/g, '.*')
        .replace(/\?/g, '.');
    return new RegExp('^' + pattern + '$').test(String(str));
}

function isValidIpAddress(addr) {
    var parts = String(addr).split('.');
    if (parts.length !== 4) {
        return false;
    }
    for (var i = 0; i < 4; i++) {
        if (!/^\d{1,3}$/.test(parts[i]) || Number(parts[i]) > 255) {
            return false;
        }
    }
    return true;
}

function convert_addr(ipchars) {
    var bytes = String(ipchars).split('.');
    return (((bytes[0] & 0xff) << 24) |
        ((bytes[1] & 0xff) << 16) |
        ((bytes[2] & 0xff) << 8) |
        (bytes[3] & 0xff)) >>> 0;
}

function isInNet(host, pattern, mask) {
    if (!isValidIpAddress(host) || !isValidIpAddress(pattern) || !isValidIpAddress(mask)) {
        return false;
    }
    var m = convert_addr(mask);
    return ((convert_addr(host) & m) >>> 0) === ((convert_addr(pattern) & m) >>> 0);
}
"#;
