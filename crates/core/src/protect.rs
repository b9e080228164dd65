use tracing::warn;

use crate::model::{DiffItem, InstalledItem};
use crate::pattern::PatternList;

/// Core OS and runtime components that are never removed or disabled,
/// however they were matched upstream.
pub const BUILTIN_PROTECTED: &[&str] = &[
    // Store and app installation plumbing.
    "Microsoft.WindowsStore",
    "Microsoft.StorePurchaseApp",
    "Microsoft.DesktopAppInstaller",
    "Microsoft.Services.Store.Engagement",
    // Shared UWP frameworks.
    "Microsoft.VCLibs*",
    "Microsoft.UI.Xaml*",
    "Microsoft.NET.Native*",
    "Microsoft.WindowsAppRuntime*",
    // Shell and sign-in.
    "Microsoft.Windows.ShellExperienceHost",
    "Microsoft.Windows.StartMenuExperienceHost",
    "Microsoft.Windows.CloudExperienceHost",
    "Microsoft.AAD.BrokerPlugin",
    "Microsoft.AccountsControl",
    "Microsoft.LockApp",
    "Microsoft.Windows.SecHealthUI",
    "Microsoft.SecHealthUI",
    "Windows.immersivecontrolpanel",
    "Microsoft.MicrosoftEdge*",
    // Runtimes installed through MSI.
    "Microsoft Visual C++*Redistributable*",
    "Microsoft .NET*Runtime*",
    "Microsoft Edge WebView2 Runtime",
    // Services the OS depends on.
    "WinDefend",
    "wuauserv",
    "BITS",
    "mpssvc",
    "BFE",
    "RpcSs",
    "EventLog",
    "TrustedInstaller",
];

/// Built-in safety list plus any configured additions.
#[derive(Debug, Clone)]
pub struct ProtectedList {
    patterns: PatternList,
}

impl ProtectedList {
    pub fn new(extra: &[String], warnings: &mut Vec<String>) -> Self {
        let patterns = PatternList::compile(
            BUILTIN_PROTECTED
                .iter()
                .map(|entry| entry.to_string())
                .chain(extra.iter().cloned()),
            warnings,
        );
        Self { patterns }
    }

    pub fn builtin() -> Self {
        let mut warnings = Vec::new();
        Self::new(&[], &mut warnings)
    }

    /// The protected pattern covering any of the given names.
    pub fn protecting<'a>(&self, mut names: impl Iterator<Item = &'a str>) -> Option<&str> {
        names.find_map(|name| self.patterns.first_match(name))
    }

    pub fn check_item(&self, item: &InstalledItem) -> Option<&str> {
        self.protecting(item.names())
    }

    pub fn check_diff_item(&self, item: &DiffItem) -> Option<&str> {
        let names = std::iter::once(item.name.as_str()).chain(item.display_name.as_deref());
        self.protecting(names)
    }

    /// Drops protected entries, logging each one.
    pub fn filter_items(&self, items: Vec<DiffItem>, warnings: &mut Vec<String>) -> Vec<DiffItem> {
        items
            .into_iter()
            .filter(|item| match self.check_diff_item(item) {
                Some(pattern) => {
                    warn!(item = %item.label(), protected_by = pattern, "protected item removed from diff");
                    warnings.push(format!(
                        "{} is protected by `{}` and was excluded from the diff",
                        item.label(),
                        pattern
                    ));
                    false
                }
                None => true,
            })
            .collect()
    }
}

impl Default for ProtectedList {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::ProtectedList;
    use crate::model::{InstalledItem, Source};

    #[test]
    fn store_and_frameworks_are_protected() {
        let list = ProtectedList::builtin();
        let store = InstalledItem::new("Microsoft.WindowsStore", Source::Appx);
        let vclibs = InstalledItem::new("Microsoft.VCLibs.140.00.UWPDesktop", Source::Appx);
        let candy = InstalledItem::new("king.com.CandyCrushSaga", Source::Appx);

        assert_eq!(list.check_item(&store), Some("Microsoft.WindowsStore"));
        assert_eq!(list.check_item(&vclibs), Some("Microsoft.VCLibs*"));
        assert_eq!(list.check_item(&candy), None);
    }

    #[test]
    fn display_name_is_checked_too() {
        let list = ProtectedList::builtin();
        let mut item = InstalledItem::new("{5FCE6D76-F5DC-37AB-B2B8-22AB8CEDB1D4}", Source::Registry);
        item.display_name =
            Some("Microsoft Visual C++ 2015-2022 Redistributable (x64)".to_string());
        assert!(list.check_item(&item).is_some());
    }

    #[test]
    fn configured_patterns_extend_the_builtin_list() {
        let mut warnings = Vec::new();
        let list = ProtectedList::new(&["Contoso*".to_string()], &mut warnings);
        assert!(warnings.is_empty());
        assert!(list
            .check_item(&InstalledItem::new("Contoso VPN", Source::Registry))
            .is_some());
        assert!(list
            .check_item(&InstalledItem::new("Microsoft.WindowsStore", Source::Appx))
            .is_some());
    }
}
