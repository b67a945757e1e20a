//! Integration tests for draft-level tree editing

use super::test_utils::*;
use braid::error::TreeError;
use braid::types::NodeType;

#[tokio::test]
async fn test_init_context_seeds_perspective_and_draft() {
    let bed = bed();
    let pid = bed
        .tree
        .init_context(&backend_id(), "hello", NodeType::Paragraph, 1)
        .await
        .unwrap();
    drain(&bed).await;

    let perspective = bed.router.get_perspective(&pid).await.unwrap().unwrap();
    assert_eq!(perspective.name, "first");
    assert!(!perspective.context.is_empty());

    let draft = bed.tree.get_draft(&pid).unwrap().unwrap();
    assert_eq!(draft.text, "hello");
    assert_eq!(draft.doc_node_type, NodeType::Paragraph);
    assert!(draft.links.is_empty());
}

/// Seeds created back to back, with identical content and the same
/// timestamp, must still land on distinct contexts and perspectives.
#[tokio::test]
async fn test_same_instant_seeds_stay_distinct() {
    let bed = bed();
    let a = bed
        .tree
        .init_context(&backend_id(), "twin", NodeType::Paragraph, 7)
        .await
        .unwrap();
    let b = bed
        .tree
        .init_context(&backend_id(), "twin", NodeType::Paragraph, 7)
        .await
        .unwrap();
    drain(&bed).await;

    assert_ne!(a, b);
    let pa = bed.router.get_perspective(&a).await.unwrap().unwrap();
    let pb = bed.router.get_perspective(&b).await.unwrap().unwrap();
    assert_ne!(pa.context, pb.context);
}

/// Two siblings spliced under the same parent in one instant are two
/// nodes, not one node linked twice.
#[tokio::test]
async fn test_same_instant_siblings_stay_distinct() {
    let bed = bed();
    let root = bed
        .tree
        .init_context(&backend_id(), "doc", NodeType::Title, 1)
        .await
        .unwrap();
    let one = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "row", NodeType::Paragraph)
        .await
        .unwrap();
    let two = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "row", NodeType::Paragraph)
        .await
        .unwrap();
    drain(&bed).await;

    assert_ne!(one, two);
    let links = bed.tree.get_draft(&root).unwrap().unwrap().links;
    assert_eq!(links, vec![one, two]);
}

#[tokio::test]
async fn test_insert_then_remove_restores_links() {
    let bed = bed();
    let parent = create_perspective(&bed, "ctx-parent", 1).await;
    let child_a = create_perspective(&bed, "ctx-a", 2).await;
    let child_b = create_perspective(&bed, "ctx-b", 3).await;

    bed.tree.insert_perspective(&parent, &child_a, -1).await.unwrap();
    let before = bed.tree.get_draft(&parent).unwrap().unwrap().links;

    bed.tree.insert_perspective(&parent, &child_b, 0).await.unwrap();
    assert_eq!(
        bed.tree.get_draft(&parent).unwrap().unwrap().links,
        vec![child_b.clone(), child_a.clone()]
    );

    let removed = bed.tree.remove_perspective(&parent, 0).await.unwrap();
    assert_eq!(removed, child_b);
    assert_eq!(bed.tree.get_draft(&parent).unwrap().unwrap().links, before);
}

#[tokio::test]
async fn test_out_of_range_removal_is_missing_parent() {
    let bed = bed();
    let parent = create_perspective(&bed, "ctx-parent", 1).await;

    let err = bed.tree.remove_perspective(&parent, 0).await.unwrap_err();
    assert!(matches!(err, TreeError::MissingParent(_)));

    let err = bed
        .tree
        .insert_perspective(&parent, &create_perspective(&bed, "ctx-c", 2).await, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::MissingParent(_)));
}

#[tokio::test]
async fn test_set_draft_text_preserves_type_and_links() {
    let bed = bed();
    let parent = create_perspective(&bed, "ctx-parent", 1).await;
    let child = create_perspective(&bed, "ctx-child", 2).await;

    bed.tree.set_draft_type(&parent, NodeType::Title).await.unwrap();
    bed.tree.insert_perspective(&parent, &child, -1).await.unwrap();
    bed.tree.set_draft_text(&parent, "heading").await.unwrap();

    let draft = bed.tree.get_draft(&parent).unwrap().unwrap();
    assert_eq!(draft.text, "heading");
    assert_eq!(draft.doc_node_type, NodeType::Title);
    assert_eq!(draft.links, vec![child]);
}

#[tokio::test]
async fn test_init_context_under_splices_child() {
    let bed = bed();
    let root = bed
        .tree
        .init_context(&backend_id(), "doc", NodeType::Title, 1)
        .await
        .unwrap();

    let first = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "one", NodeType::Paragraph)
        .await
        .unwrap();
    let second = bed
        .tree
        .init_context_under(&backend_id(), &root, 0, "zero", NodeType::Paragraph)
        .await
        .unwrap();

    let draft = bed.tree.get_draft(&root).unwrap().unwrap();
    assert_eq!(draft.links, vec![second, first]);
}

/// Title to paragraph moves the block's children up as its younger
/// siblings under the old parent.
#[tokio::test]
async fn test_set_style_title_to_paragraph_reparents_children() {
    let bed = bed();
    let root = bed
        .tree
        .init_context(&backend_id(), "doc", NodeType::Title, 1)
        .await
        .unwrap();
    let section = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "section", NodeType::Title)
        .await
        .unwrap();
    let leaf_a = bed
        .tree
        .init_context_under(&backend_id(), &section, -1, "a", NodeType::Paragraph)
        .await
        .unwrap();
    let leaf_b = bed
        .tree
        .init_context_under(&backend_id(), &section, -1, "b", NodeType::Paragraph)
        .await
        .unwrap();

    bed.tree.set_style(&root, 0, NodeType::Paragraph).await.unwrap();

    assert!(bed.tree.get_draft(&section).unwrap().unwrap().links.is_empty());
    assert_eq!(
        bed.tree.get_draft(&root).unwrap().unwrap().links,
        vec![section, leaf_a, leaf_b]
    );
}

/// Paragraph to title adopts its younger siblings, stopping at the next
/// title.
#[tokio::test]
async fn test_set_style_paragraph_to_title_adopts_siblings() {
    let bed = bed();
    let root = bed
        .tree
        .init_context(&backend_id(), "doc", NodeType::Title, 1)
        .await
        .unwrap();
    let para = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "p", NodeType::Paragraph)
        .await
        .unwrap();
    let sib_a = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "a", NodeType::Paragraph)
        .await
        .unwrap();
    let stop = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "t", NodeType::Title)
        .await
        .unwrap();
    let after = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "z", NodeType::Paragraph)
        .await
        .unwrap();

    bed.tree.set_style(&root, 0, NodeType::Title).await.unwrap();

    assert_eq!(
        bed.tree.get_draft(&root).unwrap().unwrap().links,
        vec![para.clone(), stop, after]
    );
    assert_eq!(bed.tree.get_draft(&para).unwrap().unwrap().links, vec![sib_a]);
    assert_eq!(
        bed.tree.get_draft(&para).unwrap().unwrap().doc_node_type,
        NodeType::Title
    );
}

#[tokio::test]
async fn test_indent_left_moves_title_to_grandparent() {
    let bed = bed();
    let root = bed
        .tree
        .init_context(&backend_id(), "doc", NodeType::Title, 1)
        .await
        .unwrap();
    let section = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "s", NodeType::Title)
        .await
        .unwrap();
    let nested = bed
        .tree
        .init_context_under(&backend_id(), &section, -1, "n", NodeType::Title)
        .await
        .unwrap();

    bed.tree.indent_left(&root, &section, 0).await.unwrap();

    assert!(bed.tree.get_draft(&section).unwrap().unwrap().links.is_empty());
    assert_eq!(
        bed.tree.get_draft(&root).unwrap().unwrap().links,
        vec![section, nested]
    );
}

#[tokio::test]
async fn test_perspective_full_levels() {
    let bed = bed();
    let root = bed
        .tree
        .init_context(&backend_id(), "doc", NodeType::Title, 1)
        .await
        .unwrap();
    let child = bed
        .tree
        .init_context_under(&backend_id(), &root, -1, "c", NodeType::Paragraph)
        .await
        .unwrap();
    bed.tree
        .init_context_under(&backend_id(), &child, -1, "g", NodeType::Paragraph)
        .await
        .unwrap();
    drain(&bed).await;

    let shallow = bed.tree.get_perspective_full(&root, 0).await.unwrap();
    assert!(shallow.draft.unwrap().links.is_empty());

    let one = bed.tree.get_perspective_full(&root, 1).await.unwrap();
    let child_full = &one.draft.as_ref().unwrap().links[0];
    assert_eq!(child_full.id, child);
    assert!(child_full.draft.as_ref().unwrap().links.is_empty());

    let full = bed.tree.get_perspective_full(&root, -1).await.unwrap();
    let child_full = &full.draft.as_ref().unwrap().links[0];
    assert_eq!(child_full.draft.as_ref().unwrap().links.len(), 1);
}

#[tokio::test]
async fn test_text_node_tree_prefers_draft() {
    let bed = bed();
    let root = create_perspective(&bed, "ctx-root", 1).await;
    commit_node(&bed, &root, "committed", vec![], 2).await;
    drain(&bed).await;

    let tree = bed.tree.to_text_node_tree(&root).await.unwrap().unwrap();
    assert_eq!(tree.text, "committed");

    bed.tree.set_draft_text(&root, "drafted").await.unwrap();
    let tree = bed.tree.to_text_node_tree(&root).await.unwrap().unwrap();
    assert_eq!(tree.text, "drafted");
}

#[tokio::test]
async fn test_cyclic_links_detected_on_traversal() {
    let bed = bed();
    let root = create_perspective(&bed, "ctx-cycle", 1).await;
    bed.tree.insert_perspective(&root, &root, -1).await.unwrap();
    drain(&bed).await;

    let err = bed.tree.get_perspective_full(&root, -1).await.unwrap_err();
    assert!(matches!(err, TreeError::CycleDetected(_)));
    let err = bed.tree.to_text_node_tree(&root).await.unwrap_err();
    assert!(matches!(err, TreeError::CycleDetected(_)));
}
