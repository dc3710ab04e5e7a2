//! import 名 → PyPI 包名

/// 导入名与发行包名不一致的常见情形
const IMPORT_TO_PACKAGE: &[(&str, &str)] = &[
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("PIL", "pillow"),
    ("Image", "pillow"),
    ("yaml", "pyyaml"),
    ("dotenv", "python-dotenv"),
    ("bs4", "beautifulsoup4"),
    ("wx", "wxpython"),
    ("OpenSSL", "pyopenssl"),
    ("dateutil", "python-dateutil"),
    ("google", "google-cloud"),
    ("azure", "azure-storage-blob"),
    ("skimage", "scikit-image"),
    ("Crypto", "pycryptodome"),
    ("serial", "pyserial"),
    ("attr", "attrs"),
    ("jwt", "pyjwt"),
    ("magic", "python-magic"),
    ("docx", "python-docx"),
    ("pptx", "python-pptx"),
];

/// 未收录的模块名原样作为包名
pub fn package_for_module(module: &str) -> String {
    let top = module.split('.').next().unwrap_or(module);
    IMPORT_TO_PACKAGE
        .iter()
        .find(|(import, _)| *import == top)
        .map(|(_, package)| (*package).to_string())
        .unwrap_or_else(|| top.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_names() {
        assert_eq!(package_for_module("cv2"), "opencv-python");
        assert_eq!(package_for_module("sklearn.linear_model"), "scikit-learn");
        assert_eq!(package_for_module("PIL"), "pillow");
    }

    #[test]
    fn test_unmapped_names_pass_through() {
        assert_eq!(package_for_module("numpy"), "numpy");
        assert_eq!(package_for_module("nonexistent_pkg_xyz"), "nonexistent_pkg_xyz");
    }
}
