use lazy_static::lazy_static;
use tera::Tera;

lazy_static! {
    /// Compiled templates for every generated configuration text. Templates
    /// are embedded so the binary has no runtime asset directory.
    pub static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        let result = tera.add_raw_templates(vec![
            ("dnsmasq.conf", include_str!("../templates/dnsmasq.conf.tera")),
            ("hostapd.conf", include_str!("../templates/hostapd.conf.tera")),
            ("nginx-vhost.conf", include_str!("../templates/nginx-vhost.conf.tera")),
            ("credentials.txt", include_str!("../templates/credentials.txt.tera")),
        ]);
        if let Err(e) = result {
            eprintln!("Template parsing error: {}", e);
            std::process::exit(1);
        }
        // Generated files are plain config text, not HTML.
        tera.autoescape_on(vec![]);
        tera
    };
}
