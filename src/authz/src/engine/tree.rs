//! Forest rendering over the flat permission catalog
//!
//! Both renderers first index children by `parent_code`, then walk the index
//! from the roots (entries with an empty `parent_code`). Siblings are ordered
//! by `sort_order`, then `code`. Entries whose parent is not in the input are
//! not reachable from a root and are left out.

use crate::models::{MenuNode, Permission, PermissionNode};
use crate::types::PermissionType;
use std::collections::{HashMap, HashSet};

/// Icon and route used for menus that carry no presentation attributes
const MENU_DEFAULTS: &[(&str, &str, &str)] = &[
    ("dashboard_menu", "dashboard", "/dashboard"),
    ("system_menu", "setting", "/system"),
    ("tenant_menu", "apartment", "/system/tenant"),
    ("user_menu", "user", "/system/user"),
    ("role_menu", "team", "/system/role"),
    ("permission_menu", "safety", "/system/permission"),
    ("field_permission_menu", "eye", "/system/field-permission"),
    ("audit_menu", "audit", "/system/audit"),
];

const MODULE_ICONS: &[(&str, &str)] = &[
    ("system", "setting"),
    ("tenant", "apartment"),
    ("user", "user"),
    ("role", "team"),
    ("permission", "safety"),
    ("audit", "audit"),
];

const FALLBACK_ICON: &str = "menu";

struct ChildIndex<'a> {
    children: HashMap<&'a str, Vec<&'a Permission>>,
}

impl<'a> ChildIndex<'a> {
    fn new(permissions: &'a [Permission]) -> Self {
        let mut children: HashMap<&str, Vec<&Permission>> = HashMap::new();
        for permission in permissions {
            children.entry(permission.parent_code.as_str()).or_default().push(permission);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.code.cmp(&b.code)));
        }
        Self { children }
    }

    fn children_of(&self, code: &str) -> &[&'a Permission] {
        self.children.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Depth-first render. `seen` keeps any code from being emitted twice,
    /// which also stops parent cycles.
    fn render<T>(
        &self,
        parent: &str,
        seen: &mut HashSet<&'a str>,
        node: &impl Fn(&'a Permission, Vec<T>) -> T,
    ) -> Vec<T> {
        let mut rendered = Vec::new();
        for &permission in self.children_of(parent) {
            if !seen.insert(permission.code.as_str()) {
                continue;
            }
            let children = self.render(&permission.code, seen, node);
            rendered.push(node(permission, children));
        }
        rendered
    }
}

/// Build the permission forest
pub fn build_permission_tree(permissions: &[Permission]) -> Vec<PermissionNode> {
    let index = ChildIndex::new(permissions);
    let mut seen = HashSet::new();
    index.render("", &mut seen, &|permission, children| PermissionNode {
        permission: permission.clone(),
        children,
    })
}

/// Build the navigation menu from the `menu`-type entries of `permissions`
pub fn build_menu_tree(permissions: &[Permission]) -> Vec<MenuNode> {
    let menus: Vec<Permission> = permissions
        .iter()
        .filter(|p| p.permission_type == PermissionType::Menu)
        .cloned()
        .collect();

    let index = ChildIndex::new(&menus);
    let mut seen = HashSet::new();
    index.render("", &mut seen, &|permission, children| menu_node(permission, children))
}

fn menu_node(permission: &Permission, children: Vec<MenuNode>) -> MenuNode {
    let known = MENU_DEFAULTS.iter().find(|(code, _, _)| *code == permission.code);

    let icon = if !permission.menu.icon.is_empty() {
        permission.menu.icon.clone()
    } else if let Some((_, icon, _)) = known {
        icon.to_string()
    } else {
        module_icon(&permission.module).to_string()
    };

    let path = if !permission.menu.path.is_empty() {
        permission.menu.path.clone()
    } else if let Some((_, _, path)) = known {
        path.to_string()
    } else {
        derived_path(&permission.code)
    };

    MenuNode {
        code: permission.code.clone(),
        name: permission.name.clone(),
        icon,
        path,
        component: permission.menu.component.clone(),
        visible: permission.menu.visible,
        sort_order: permission.sort_order,
        children,
    }
}

fn module_icon(module: &str) -> &'static str {
    MODULE_ICONS
        .iter()
        .find(|(name, _)| *name == module)
        .map(|(_, icon)| *icon)
        .unwrap_or(FALLBACK_ICON)
}

/// `report_sales_menu` becomes `/report/sales`
fn derived_path(code: &str) -> String {
    format!("/{}", code.trim_end_matches("_menu").replace('_', "/"))
}
